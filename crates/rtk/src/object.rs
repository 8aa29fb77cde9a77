//! Object identifiers and the fixed-capacity arenas that own kernel objects.
//!
//! Objects never reference each other by pointer. A handle carries the slot
//! index and the slot's generation at creation time; once the object is
//! deleted the generation moves on and every outstanding handle turns into
//! [`Status::InvalidId`].

use core::fmt;

use crate::status::{Result, Status};

/// Slot index plus generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObjectId {
    index: u16,
    generation: u16,
}

impl ObjectId {
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn generation(&self) -> u16 {
        self.generation
    }

    /// Packs the id into 32 bits for trace payloads.
    pub fn raw(&self) -> u32 {
        (u32::from(self.generation) << 16) | u32::from(self.index)
    }
}

pub(crate) trait Handle: Copy {
    fn from_object(id: ObjectId) -> Self;
    fn object(self) -> ObjectId;
}

macro_rules! object_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub struct $name(ObjectId);

        impl $name {
            pub fn object_id(&self) -> ObjectId {
                self.0
            }
        }

        impl Handle for $name {
            fn from_object(id: ObjectId) -> Self {
                Self(id)
            }

            fn object(self) -> ObjectId {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}.{}"), self.0.index, self.0.generation)
            }
        }
    };
}

object_handle!(
    /// Handle of a task.
    TaskId,
    "task#"
);
object_handle!(
    /// Handle of a semaphore (counting, simple binary or mutex).
    SemaphoreId,
    "sem#"
);
object_handle!(
    /// Handle of a barrier.
    BarrierId,
    "barrier#"
);
object_handle!(
    /// Handle of a message queue.
    MessageQueueId,
    "mq#"
);
object_handle!(
    /// Handle of a rate-monotonic period.
    PeriodId,
    "period#"
);
object_handle!(
    /// Handle of a dynamically installed extension set.
    ExtensionId,
    "ext#"
);

struct Slot<T> {
    generation: u16,
    value: Option<T>,
}

/// Fixed-capacity arena with generational handles.
pub(crate) struct Arena<I, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u16>,
    capacity: usize,
    live: usize,
    _handle: core::marker::PhantomData<I>,
}

impl<I: Handle, T> Arena<I, T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity: capacity.min(u16::MAX as usize),
            live: 0,
            _handle: core::marker::PhantomData,
        }
    }

    /// Inserts a value built from its own handle.
    pub(crate) fn insert_with(&mut self, build: impl FnOnce(I) -> T) -> Result<I> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                (self.slots.len() - 1) as u16
            }
            None => return Err(Status::TooMany),
        };
        let slot = &mut self.slots[index as usize];
        let handle = I::from_object(ObjectId {
            index,
            generation: slot.generation,
        });
        slot.value = Some(build(handle));
        self.live += 1;
        Ok(handle)
    }

    pub(crate) fn get(&self, id: I) -> Option<&T> {
        let id = id.object();
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: I) -> Option<&mut T> {
        let id = id.object();
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub(crate) fn contains(&self, id: I) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn remove(&mut self, id: I) -> Option<T> {
        let object = id.object();
        let slot = self.slots.get_mut(object.index as usize)?;
        if slot.generation != object.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(object.index);
        self.live -= 1;
        Some(value)
    }

    pub(crate) fn ids(&self) -> Vec<I> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(index, slot)| {
                I::from_object(ObjectId {
                    index: index as u16,
                    generation: slot.generation,
                })
            })
            .collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.value.as_ref())
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_enforced() {
        let mut arena: Arena<TaskId, u32> = Arena::new(2);
        arena.insert_with(|_| 1).expect("first");
        arena.insert_with(|_| 2).expect("second");
        assert_eq!(arena.insert_with(|_| 3), Err(Status::TooMany));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn stale_handle_is_rejected_after_reuse() {
        let mut arena: Arena<SemaphoreId, &str> = Arena::new(1);
        let first = arena.insert_with(|_| "first").expect("insert");
        assert_eq!(arena.remove(first), Some("first"));
        let second = arena.insert_with(|_| "second").expect("reuse");

        assert_eq!(first.object_id().index(), second.object_id().index());
        assert_ne!(first, second);
        assert!(arena.get(first).is_none());
        assert_eq!(arena.get(second), Some(&"second"));
        assert!(arena.remove(first).is_none());
    }

    #[test]
    fn builder_sees_its_own_handle() {
        let mut arena: Arena<BarrierId, BarrierId> = Arena::new(4);
        let id = arena.insert_with(|id| id).expect("insert");
        assert_eq!(arena.get(id), Some(&id));
        assert_eq!(arena.ids(), vec![id]);
    }
}
