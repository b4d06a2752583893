// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # CpuSet
//!
//! An immutable value type representing a set of CPU ids, with the set
//! algebra the allocator needs and a canonical, range-compressed string
//! form ("0-3,8,10-11") whose parser is the exact inverse of `Display`.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

/// A set of non-negative CPU ids. All operations return new sets; a
/// `CpuSet` is never mutated in place.
#[derive(Debug, Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CpuSet {
    cpus: BTreeSet<usize>,
}

impl CpuSet {
    /// Build a CpuSet from any collection of CPU ids.
    pub fn new<I>(cpus: I) -> CpuSet
    where
        I: IntoIterator<Item = usize>,
    {
        CpuSet {
            cpus: cpus.into_iter().collect(),
        }
    }

    /// Number of CPUs in the set.
    pub fn size(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.cpus.contains(&cpu)
    }

    /// Set union with `other`.
    pub fn union(&self, other: &CpuSet) -> CpuSet {
        CpuSet {
            cpus: self.cpus.union(&other.cpus).copied().collect(),
        }
    }

    /// CPUs present in `self` but not in `other`.
    pub fn difference(&self, other: &CpuSet) -> CpuSet {
        CpuSet {
            cpus: self.cpus.difference(&other.cpus).copied().collect(),
        }
    }

    /// CPUs present in both `self` and `other`.
    pub fn intersection(&self, other: &CpuSet) -> CpuSet {
        CpuSet {
            cpus: self.cpus.intersection(&other.cpus).copied().collect(),
        }
    }

    pub fn is_subset_of(&self, other: &CpuSet) -> bool {
        self.cpus.is_subset(&other.cpus)
    }

    /// Iterate over the CPU ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.cpus.iter().copied()
    }

    /// The CPU ids as a sorted vector.
    pub fn as_vec(&self) -> Vec<usize> {
        self.cpus.iter().copied().collect()
    }

    /// Parse the canonical string form produced by `Display`: a
    /// comma-separated ascending list of single ids or inclusive `lo-hi`
    /// ranges. Whitespace, signs, empty components and descending ranges
    /// are format errors. The empty string parses to the empty set.
    pub fn parse(s: &str) -> Result<CpuSet> {
        let mut cpus = BTreeSet::new();
        if s.is_empty() {
            return Ok(CpuSet { cpus });
        }
        for part in s.split(',') {
            let (lo, hi) = match part.split_once('-') {
                Some((lo, hi)) => (parse_cpu_id(lo, s)?, parse_cpu_id(hi, s)?),
                None => {
                    let cpu = parse_cpu_id(part, s)?;
                    (cpu, cpu)
                }
            };
            if lo > hi {
                bail!("descending CPU range {:?} in CPU list {:?}", part, s);
            }
            for cpu in lo..=hi {
                cpus.insert(cpu);
            }
        }
        Ok(CpuSet { cpus })
    }
}

fn parse_cpu_id(tok: &str, list: &str) -> Result<usize> {
    if tok.is_empty() || !tok.bytes().all(|b| b.is_ascii_digit()) {
        bail!("invalid CPU id {:?} in CPU list {:?}", tok, list);
    }
    tok.parse::<usize>()
        .with_context(|| format!("invalid CPU id {tok:?} in CPU list {list:?}"))
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> CpuSet {
        CpuSet::new(iter)
    }
}

impl fmt::Display for CpuSet {
    /// Render as sorted, range-compressed runs, e.g. "0-3,8,10-11". Runs
    /// of length one are rendered as a single id.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut ids = self.cpus.iter().copied().peekable();
        while let Some(lo) = ids.next() {
            let mut hi = lo;
            while ids.peek() == Some(&(hi + 1)) {
                hi = ids.next().unwrap();
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if lo == hi {
                write!(f, "{lo}")?;
            } else {
                write!(f, "{lo}-{hi}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algebra() {
        let a = CpuSet::new([0, 1, 2, 3]);
        let b = CpuSet::new([2, 3, 4]);

        assert_eq!(a.size(), 4);
        assert!(a.contains(3));
        assert!(!a.contains(4));
        assert_eq!(a.union(&b), CpuSet::new([0, 1, 2, 3, 4]));
        assert_eq!(a.difference(&b), CpuSet::new([0, 1]));
        assert_eq!(a.intersection(&b), CpuSet::new([2, 3]));
        assert!(CpuSet::new([1, 2]).is_subset_of(&a));
        assert!(!b.is_subset_of(&a));
        assert!(CpuSet::default().is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(CpuSet::default().to_string(), "");
        assert_eq!(CpuSet::new([5]).to_string(), "5");
        assert_eq!(CpuSet::new([0, 1, 2, 3]).to_string(), "0-3");
        assert_eq!(CpuSet::new([0, 1, 2, 3, 8, 10, 11]).to_string(), "0-3,8,10-11");
        assert_eq!(CpuSet::new([7, 6, 0]).to_string(), "0,6-7");
    }

    #[test]
    fn test_parse_round_trip() {
        for cpus in [
            CpuSet::default(),
            CpuSet::new([0]),
            CpuSet::new([0, 1, 2, 3, 8, 10, 11]),
            CpuSet::new([1, 3, 5, 6, 7]),
        ] {
            assert_eq!(CpuSet::parse(&cpus.to_string()).unwrap(), cpus);
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for s in [
            " 1", "1 ", "1, 2", "1-", "-1", "3-1", "1,,2", "1 - 3", "a", "0x3", "+2", ",",
        ] {
            assert!(CpuSet::parse(s).is_err(), "expected parse failure for {s:?}");
        }
    }

    #[test]
    fn test_parse_accepts_degenerate_range() {
        assert_eq!(CpuSet::parse("3-3").unwrap(), CpuSet::new([3]));
    }
}
