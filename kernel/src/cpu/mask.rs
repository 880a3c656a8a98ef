//! CPU bitmask
//!
//! Fixed 256-bit set identifying a subset of CPUs. Small enough to pass by
//! copy; all operations are value-level with no locking.

use core::fmt;

/// Compile-time CPU cap. Topology and runqueue arrays are sized by the
/// runtime CPU count, but masks always carry this many bits.
pub const MAX_CPUS: usize = 256;

const WORDS: usize = MAX_CPUS / 64;

/// Fixed-size CPU set.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CpuMask {
    bits: [u64; WORDS],
}

impl CpuMask {
    /// No CPUs.
    pub const fn empty() -> Self {
        Self { bits: [0; WORDS] }
    }

    /// All CPUs up to the compile-time cap.
    pub const fn all() -> Self {
        Self { bits: [u64::MAX; WORDS] }
    }

    /// CPUs `0..n`.
    pub fn first_n(n: usize) -> Self {
        let mut mask = Self::empty();
        for cpu in 0..n.min(MAX_CPUS) {
            mask.set(cpu);
        }
        mask
    }

    /// Single-CPU mask.
    pub fn single(cpu: usize) -> Self {
        let mut mask = Self::empty();
        mask.set(cpu);
        mask
    }

    pub fn set(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.bits[cpu / 64] |= 1 << (cpu % 64);
        }
    }

    pub fn clear(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.bits[cpu / 64] &= !(1 << (cpu % 64));
        }
    }

    pub fn test(&self, cpu: usize) -> bool {
        cpu < MAX_CPUS && (self.bits[cpu / 64] >> (cpu % 64)) & 1 != 0
    }

    pub fn and(&self, other: &Self) -> Self {
        let mut out = Self::empty();
        for i in 0..WORDS {
            out.bits[i] = self.bits[i] & other.bits[i];
        }
        out
    }

    pub fn or(&self, other: &Self) -> Self {
        let mut out = Self::empty();
        for i in 0..WORDS {
            out.bits[i] = self.bits[i] | other.bits[i];
        }
        out
    }

    pub fn any(&self) -> bool {
        self.bits.iter().any(|&w| w != 0)
    }

    pub fn is_empty(&self) -> bool {
        !self.any()
    }

    /// Number of CPUs in the set.
    pub fn weight(&self) -> u32 {
        self.bits.iter().map(|w| w.count_ones()).sum()
    }

    /// True when the mask pins to exactly one CPU.
    pub fn is_single(&self) -> bool {
        self.weight() == 1
    }

    /// Lowest CPU in the set.
    pub fn first(&self) -> Option<usize> {
        for (i, &word) in self.bits.iter().enumerate() {
            if word != 0 {
                return Some(i * 64 + word.trailing_zeros() as usize);
            }
        }
        None
    }

    /// Lowest CPU strictly greater than `cpu`.
    pub fn next(&self, cpu: usize) -> Option<usize> {
        let mut candidate = cpu + 1;
        while candidate < MAX_CPUS {
            let word = self.bits[candidate / 64] >> (candidate % 64);
            if word == 0 {
                // Skip the rest of this word.
                candidate = (candidate / 64 + 1) * 64;
                continue;
            }
            return Some(candidate + word.trailing_zeros() as usize);
        }
        None
    }

    /// Iterate set CPUs in ascending order.
    pub fn iter(&self) -> CpuMaskIter {
        CpuMaskIter { mask: *self, next: self.first() }
    }
}

impl Default for CpuMask {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask{{")?;
        let mut first = true;
        for cpu in self.iter() {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", cpu)?;
            first = false;
        }
        write!(f, "}}")
    }
}

pub struct CpuMaskIter {
    mask: CpuMask,
    next: Option<usize>,
}

impl Iterator for CpuMaskIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let current = self.next?;
        self.next = self.mask.next(current);
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use static_assertions::{const_assert, const_assert_eq};

    // The word layout assumes this.
    const_assert_eq!(MAX_CPUS % 64, 0);
    const_assert!(MAX_CPUS <= u32::MAX as usize);

    #[test]
    fn set_test_clear() {
        let mut mask = CpuMask::empty();
        assert!(!mask.test(5));
        mask.set(5);
        assert!(mask.test(5));
        assert_eq!(mask.weight(), 1);
        assert!(mask.is_single());
        mask.clear(5);
        assert!(mask.is_empty());
    }

    #[test]
    fn first_and_next_walk_in_order() {
        let mut mask = CpuMask::empty();
        for cpu in [3usize, 64, 65, 200] {
            mask.set(cpu);
        }
        assert_eq!(mask.first(), Some(3));
        assert_eq!(mask.next(3), Some(64));
        assert_eq!(mask.next(64), Some(65));
        assert_eq!(mask.next(65), Some(200));
        assert_eq!(mask.next(200), None);
        let collected: alloc::vec::Vec<usize> = mask.iter().collect();
        assert_eq!(collected, [3, 64, 65, 200]);
    }

    #[test]
    fn first_n_counts() {
        let mask = CpuMask::first_n(70);
        assert_eq!(mask.weight(), 70);
        assert!(mask.test(0));
        assert!(mask.test(69));
        assert!(!mask.test(70));
    }

    #[test]
    fn out_of_range_is_ignored() {
        let mut mask = CpuMask::empty();
        mask.set(MAX_CPUS + 10);
        assert!(mask.is_empty());
        assert!(!mask.test(MAX_CPUS + 10));
    }

    proptest! {
        #[test]
        fn and_is_subset_of_both(a in prop::collection::vec(0usize..MAX_CPUS, 0..32),
                                 b in prop::collection::vec(0usize..MAX_CPUS, 0..32)) {
            let mut ma = CpuMask::empty();
            let mut mb = CpuMask::empty();
            for &cpu in &a { ma.set(cpu); }
            for &cpu in &b { mb.set(cpu); }
            let and = ma.and(&mb);
            for cpu in and.iter() {
                prop_assert!(ma.test(cpu) && mb.test(cpu));
            }
            prop_assert!(and.weight() <= ma.weight().min(mb.weight()));
        }

        #[test]
        fn or_weight_is_union_cardinality(a in prop::collection::vec(0usize..MAX_CPUS, 0..32),
                                          b in prop::collection::vec(0usize..MAX_CPUS, 0..32)) {
            let mut ma = CpuMask::empty();
            let mut mb = CpuMask::empty();
            for &cpu in &a { ma.set(cpu); }
            for &cpu in &b { mb.set(cpu); }
            let or = ma.or(&mb);
            let mut expected: alloc::vec::Vec<usize> = a.iter().chain(b.iter()).copied().collect();
            expected.sort_unstable();
            expected.dedup();
            prop_assert_eq!(or.weight() as usize, expected.len());
        }

        #[test]
        fn iter_matches_test(set in prop::collection::btree_set(0usize..MAX_CPUS, 0..64)) {
            let mut mask = CpuMask::empty();
            for &cpu in &set { mask.set(cpu); }
            let walked: alloc::vec::Vec<usize> = mask.iter().collect();
            let expected: alloc::vec::Vec<usize> = set.into_iter().collect();
            prop_assert_eq!(walked, expected);
        }
    }
}
