//! Processor sets.

use core::fmt;

/// Index of a processor.
pub type CpuIndex = usize;

/// Upper bound of processors the bitmap representation supports.
pub const MAX_PROCESSORS: usize = 64;

/// Set of processors, used for affinities and scheduler ownership.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CpuSet(u64);

impl CpuSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// The first `count` processors.
    pub fn first_n(count: usize) -> Self {
        match count {
            0 => Self(0),
            n if n >= MAX_PROCESSORS => Self(u64::MAX),
            n => Self((1u64 << n) - 1),
        }
    }

    pub fn single(cpu: CpuIndex) -> Self {
        let mut set = Self::empty();
        set.insert(cpu);
        set
    }

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn insert(&mut self, cpu: CpuIndex) {
        if cpu < MAX_PROCESSORS {
            self.0 |= 1 << cpu;
        }
    }

    pub fn remove(&mut self, cpu: CpuIndex) {
        if cpu < MAX_PROCESSORS {
            self.0 &= !(1 << cpu);
        }
    }

    pub fn contains(&self, cpu: CpuIndex) -> bool {
        cpu < MAX_PROCESSORS && self.0 & (1 << cpu) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn intersection(&self, other: CpuSet) -> CpuSet {
        Self(self.0 & other.0)
    }

    pub fn union(&self, other: CpuSet) -> CpuSet {
        Self(self.0 | other.0)
    }

    pub fn intersects(&self, other: CpuSet) -> bool {
        self.0 & other.0 != 0
    }

    /// Lowest processor index in the set.
    pub fn first(&self) -> Option<CpuIndex> {
        (self.0 != 0).then(|| self.0.trailing_zeros() as CpuIndex)
    }

    pub fn iter(&self) -> impl Iterator<Item = CpuIndex> {
        let bits = self.0;
        (0..MAX_PROCESSORS).filter(move |cpu| bits & (1 << cpu) != 0)
    }
}

impl FromIterator<CpuIndex> for CpuSet {
    fn from_iter<T: IntoIterator<Item = CpuIndex>>(iter: T) -> Self {
        let mut set = Self::empty();
        for cpu in iter {
            set.insert(cpu);
        }
        set
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
