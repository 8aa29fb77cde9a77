//! Message queue manager.
//!
//! Messages are copied in and out. A sender that finds a receiver already
//! waiting hands the message over directly without queueing it.

use std::collections::VecDeque;

use bitflags::bitflags;

use crate::context::Caller;
use crate::kernel::State;
use crate::object::{MessageQueueId, TaskId};
use crate::status::{Result, Status};
use crate::task::{WaitObject, WaitValue};
use crate::threadq::{Discipline, ThreadQueue, Timeout};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct MessageQueueAttributes: u32 {
        /// Priority wait discipline for receivers.
        const PRIORITY = 1 << 0;
    }
}

impl MessageQueueAttributes {
    pub const FIFO: MessageQueueAttributes = MessageQueueAttributes::empty();
}

/// Observable state of a message queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQueueInfo {
    pub name: String,
    pub pending: usize,
    pub maximum_pending: usize,
    pub maximum_size: usize,
    pub waiters: Vec<TaskId>,
}

pub(crate) struct MessageQueue {
    name: String,
    maximum_pending: usize,
    maximum_size: usize,
    messages: VecDeque<Vec<u8>>,
    pub(crate) queue: ThreadQueue,
}

impl State {
    pub(crate) fn message_queue_create(
        &mut self,
        caller: Caller,
        name: &str,
        count: usize,
        maximum_size: usize,
        attributes: MessageQueueAttributes,
    ) -> Result<MessageQueueId> {
        if caller.is_interrupt() {
            return Err(Status::CalledFromIsr);
        }
        if name.is_empty() {
            return Err(Status::InvalidName);
        }
        if count == 0 {
            return Err(Status::InvalidNumber);
        }
        if maximum_size == 0 {
            return Err(Status::InvalidSize);
        }
        let discipline = if attributes.contains(MessageQueueAttributes::PRIORITY) {
            Discipline::Priority
        } else {
            Discipline::Fifo
        };
        let id = self.message_queues.insert_with(|_| MessageQueue {
            name: name.to_string(),
            maximum_pending: count,
            maximum_size,
            messages: VecDeque::with_capacity(count),
            queue: ThreadQueue::new(discipline),
        })?;
        log::debug!("created message queue {id} {name:?} ({count} x {maximum_size} bytes)");
        Ok(id)
    }

    pub(crate) fn message_queue_ident(&self, name: &str) -> Result<MessageQueueId> {
        self.message_queues
            .ids()
            .into_iter()
            .find(|id| self.message_queues.get(*id).is_some_and(|q| q.name == name))
            .ok_or(Status::InvalidName)
    }

    pub(crate) fn message_queue_info(&self, id: MessageQueueId) -> Result<MessageQueueInfo> {
        let queue = self.message_queues.get(id).ok_or(Status::InvalidId)?;
        Ok(MessageQueueInfo {
            name: queue.name.clone(),
            pending: queue.messages.len(),
            maximum_pending: queue.maximum_pending,
            maximum_size: queue.maximum_size,
            waiters: queue.queue.tasks().collect(),
        })
    }

    pub(crate) fn message_send(&mut self, id: MessageQueueId, message: &[u8], urgent: bool) -> Result<()> {
        let object = WaitObject::MessageQueue(id);
        let queue = self.message_queues.get(id).ok_or(Status::InvalidId)?;
        if message.len() > queue.maximum_size {
            return Err(Status::InvalidSize);
        }
        if !queue.queue.is_empty() {
            self.dequeue_first(object, Ok(WaitValue::Message(message.to_vec())));
            return Ok(());
        }
        let queue = self.message_queues.get_mut(id).ok_or(Status::InvalidId)?;
        if queue.messages.len() >= queue.maximum_pending {
            return Err(Status::TooMany);
        }
        if urgent {
            queue.messages.push_front(message.to_vec());
        } else {
            queue.messages.push_back(message.to_vec());
        }
        Ok(())
    }

    /// Hands a copy of `message` to every waiting receiver.
    pub(crate) fn message_broadcast(&mut self, id: MessageQueueId, message: &[u8]) -> Result<usize> {
        let queue = self.message_queues.get(id).ok_or(Status::InvalidId)?;
        if message.len() > queue.maximum_size {
            return Err(Status::InvalidSize);
        }
        let object = WaitObject::MessageQueue(id);
        let mut count = 0;
        while self
            .dequeue_first(object, Ok(WaitValue::Message(message.to_vec())))
            .is_some()
        {
            count += 1;
        }
        Ok(count)
    }

    pub(crate) fn message_receive(
        &mut self,
        caller: Caller,
        id: MessageQueueId,
        timeout: Timeout,
    ) -> Result<Vec<u8>> {
        let object = WaitObject::MessageQueue(id);
        if let Some(outcome) = self.resume_outcome(caller, object) {
            return outcome.map(|value| match value {
                WaitValue::Message(message) => message,
                WaitValue::Unit => Vec::new(),
            });
        }
        self.ensure_not_blocked(caller)?;
        let queue = self.message_queues.get_mut(id).ok_or(Status::InvalidId)?;
        if let Some(message) = queue.messages.pop_front() {
            return Ok(message);
        }
        self.wait_for(caller, object, timeout, false)
    }

    /// Discards pending messages. Returns how many were discarded.
    pub(crate) fn message_flush(&mut self, id: MessageQueueId) -> Result<usize> {
        let queue = self.message_queues.get_mut(id).ok_or(Status::InvalidId)?;
        let count = queue.messages.len();
        queue.messages.clear();
        Ok(count)
    }

    pub(crate) fn message_delete(&mut self, caller: Caller, id: MessageQueueId) -> Result<()> {
        if caller.is_interrupt() {
            return Err(Status::CalledFromIsr);
        }
        if !self.message_queues.contains(id) {
            return Err(Status::InvalidId);
        }
        self.flush_waiters(WaitObject::MessageQueue(id), Status::ObjectWasDeleted);
        self.message_queues.remove(id);
        log::debug!("deleted message queue {id}");
        Ok(())
    }
}
