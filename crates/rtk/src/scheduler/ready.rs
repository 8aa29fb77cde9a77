//! Ready structures of the two scheduling policies.
//!
//! A ready structure holds every schedulable task of its instance, including
//! the ones currently executing. Allocation walks it most urgent first;
//! tasks of equal urgency keep their insertion order.

use std::cmp::Reverse;
use std::collections::{BTreeSet, VecDeque};

use crate::config::SchedulerPolicy;
use crate::object::TaskId;
use crate::priority::PRIORITY_LEVELS;
use crate::task::ReadyKey;

/// Bitmap of non-empty priority levels.
#[derive(Debug, Default, Clone, Copy)]
struct ReadySet {
    bits: u64,
}

impl ReadySet {
    fn insert(&mut self, prio: u8) {
        Self::assert_range(prio);
        self.bits |= 1u64 << prio;
    }

    fn remove(&mut self, prio: u8) {
        Self::assert_range(prio);
        self.bits &= !(1u64 << prio);
    }

    fn max(&self) -> Option<u8> {
        if self.bits == 0 {
            None
        } else {
            Some(63 - self.bits.leading_zeros() as u8)
        }
    }

    /// Non-empty levels, highest first.
    fn levels(&self) -> impl Iterator<Item = u8> {
        let bits = self.bits;
        (0..64u8).rev().filter(move |prio| bits & (1u64 << prio) != 0)
    }

    fn assert_range(prio: u8) {
        debug_assert!(prio < 64, "priority {prio} exceeds supported range 0..63");
    }
}

/// One FIFO chain per priority level plus the bitmap of non-empty levels.
#[derive(Debug)]
pub(crate) struct PriorityChains {
    set: ReadySet,
    chains: Vec<VecDeque<TaskId>>,
}

impl PriorityChains {
    fn new() -> Self {
        Self {
            set: ReadySet::default(),
            chains: (0..PRIORITY_LEVELS).map(|_| VecDeque::new()).collect(),
        }
    }

    fn insert(&mut self, task: TaskId, key: ReadyKey) {
        let level = key.urgency.level();
        self.chains[level as usize].push_back(task);
        self.set.insert(level);
    }

    fn remove(&mut self, task: TaskId, key: ReadyKey) -> bool {
        let level = key.urgency.level();
        let chain = &mut self.chains[level as usize];
        let Some(index) = chain.iter().position(|t| *t == task) else {
            return false;
        };
        chain.remove(index);
        if chain.is_empty() {
            self.set.remove(level);
        }
        true
    }

    fn ordered(&self) -> Vec<TaskId> {
        self.set
            .levels()
            .flat_map(|level| self.chains[level as usize].iter().copied())
            .collect()
    }

    fn highest(&self) -> Option<TaskId> {
        let level = self.set.max()?;
        self.chains[level as usize].front().copied()
    }
}

/// Tasks ordered by urgency, which for EDF jobs encodes the deadline.
#[derive(Debug, Default)]
pub(crate) struct DeadlineTree {
    tree: BTreeSet<(Reverse<u64>, u64, TaskId)>,
}

impl DeadlineTree {
    fn entry(task: TaskId, key: ReadyKey) -> (Reverse<u64>, u64, TaskId) {
        (Reverse(key.urgency.0), key.seq, task)
    }

    fn insert(&mut self, task: TaskId, key: ReadyKey) {
        self.tree.insert(Self::entry(task, key));
    }

    fn remove(&mut self, task: TaskId, key: ReadyKey) -> bool {
        self.tree.remove(&Self::entry(task, key))
    }

    fn ordered(&self) -> Vec<TaskId> {
        self.tree.iter().map(|(_, _, task)| *task).collect()
    }

    fn highest(&self) -> Option<TaskId> {
        self.tree.first().map(|(_, _, task)| *task)
    }
}

#[derive(Debug)]
pub(crate) enum ReadyQueue {
    Fixed(PriorityChains),
    Deadline(DeadlineTree),
}

impl ReadyQueue {
    pub(crate) fn new(policy: SchedulerPolicy) -> Self {
        match policy {
            SchedulerPolicy::FixedPriority => Self::Fixed(PriorityChains::new()),
            SchedulerPolicy::Edf => Self::Deadline(DeadlineTree::default()),
        }
    }

    /// Appends `task` behind every task of equal urgency.
    pub(crate) fn insert(&mut self, task: TaskId, key: ReadyKey) {
        match self {
            Self::Fixed(chains) => chains.insert(task, key),
            Self::Deadline(tree) => tree.insert(task, key),
        }
    }

    pub(crate) fn remove(&mut self, task: TaskId, key: ReadyKey) -> bool {
        match self {
            Self::Fixed(chains) => chains.remove(task, key),
            Self::Deadline(tree) => tree.remove(task, key),
        }
    }

    /// Most urgent first.
    pub(crate) fn ordered(&self) -> Vec<TaskId> {
        match self {
            Self::Fixed(chains) => chains.ordered(),
            Self::Deadline(tree) => tree.ordered(),
        }
    }

    pub(crate) fn highest(&self) -> Option<TaskId> {
        match self {
            Self::Fixed(chains) => chains.highest(),
            Self::Deadline(tree) => tree.highest(),
        }
    }
}
