//! Deduplicated storage for comparison trace records, partitioned by module.
//!
//! A record is the triple `(pc_offset, tag1, tag2)` packed into a 64-bit
//! word. For integer comparisons `tag1` is the matching-prefix length and
//! `tag2` the 1-based switch case (0 outside a switch); for memory
//! comparisons `tag1` is [`MEMCMP_TAG1`](crate::MEMCMP_TAG1) and `tag2` the
//! prefix length.

use std::collections::BTreeSet;
use std::hash::{BuildHasher, Hasher};

use crate::maps::{Module, ModuleMap};
use crate::PC_OFFSET_MASK;

/// Packs `(pc_offset, tag1, tag2)` into the on-record 64-bit word:
/// offset in bits 0..48, `tag1` in 48..56, `tag2` in 56..64.
#[must_use]
pub fn encode(pc_offset: u64, tag1: u8, tag2: u8) -> u64 {
    (pc_offset & PC_OFFSET_MASK) | (u64::from(tag1) << 48) | (u64::from(tag2) << 56)
}

/// Inverse of [`encode`], for consumers and tests.
#[must_use]
pub fn decode(word: u64) -> (u64, u8, u8) {
    (
        word & PC_OFFSET_MASK,
        ((word >> 48) & 0xff) as u8,
        ((word >> 56) & 0xff) as u8,
    )
}

/// Fixed, well-mixed 64→32 bit hash used as the on-disk record narrowing on
/// 32-bit targets. The seeds are pinned so every process hashes identically.
#[must_use]
pub fn hash32(word: u64) -> u32 {
    let mut hasher = ahash::RandomState::with_seeds(0, 0, 0, 0).build_hasher();
    hasher.write_u64(word);
    hasher.finish() as u32
}

/// All execution traces registered so far, plus the module map used to
/// localize them.
///
/// Records are deduplicated per module in the 64-bit pre-hash space, and kept
/// sorted so that the flushed file contents are a pure function of the stored
/// set, independent of thread interleaving.
#[derive(Debug, Default)]
pub struct Traces {
    modules: Option<ModuleMap>,
    records: Vec<BTreeSet<u64>>,
}

impl Traces {
    /// Creates an empty store. The module map is populated on the first
    /// [`Traces::try_save`], not up front: a disabled process should never
    /// pay for enumeration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store over a caller-supplied module list, bypassing OS enumeration.
    #[must_use]
    pub fn with_modules(modules: Vec<Module>) -> Self {
        let map = ModuleMap::from_modules(modules);
        let records = vec![BTreeSet::new(); map.len()];
        Self {
            modules: Some(map),
            records,
        }
    }

    fn module_map(&mut self) -> &ModuleMap {
        let records = &mut self.records;
        self.modules.get_or_insert_with(|| {
            let map = ModuleMap::current();
            *records = vec![BTreeSet::new(); map.len()];
            map
        })
    }

    /// Resolves `pc` against the module map and inserts the encoded record.
    ///
    /// Returns whether the record was newly inserted. A `pc` outside every
    /// known module is dropped and reported as not inserted.
    pub fn try_save(&mut self, pc: usize, tag1: u8, tag2: u8) -> bool {
        let Some((index, offset)) = self.module_map().locate(pc) else {
            return false;
        };
        let offset = offset as u64;
        if offset > PC_OFFSET_MASK {
            return false;
        }
        self.records[usize::from(index)].insert(encode(offset, tag1, tag2))
    }

    /// Number of modules known to the store (0 until the first save).
    #[must_use]
    pub fn modules_count(&self) -> usize {
        self.records.len()
    }

    /// Short name of module `index`.
    #[must_use]
    pub fn module_name(&self, index: u16) -> Option<&str> {
        self.modules.as_ref()?.name(index)
    }

    /// Records of module `index`, in sorted order.
    pub fn module_records(&self, index: u16) -> impl Iterator<Item = u64> + '_ {
        self.records
            .get(usize::from(index))
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// All records as `(module_index, encoded_word)`, grouped by module.
    pub fn list_all(&self) -> impl Iterator<Item = (u16, u64)> + '_ {
        self.records
            .iter()
            .enumerate()
            .flat_map(|(index, set)| set.iter().map(move |&word| (index as u16, word)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_modules() -> Vec<Module> {
        vec![
            Module {
                name: "host".into(),
                base: 0x10000,
                size: 0x10000,
            },
            Module {
                name: "lib".into(),
                base: 0x7f0000000000,
                size: 0x1000,
            },
        ]
    }

    #[test]
    fn test_encode_decode_law() {
        let word = encode(0xdead_beef_cafe, 0x05, 0xf0);
        assert_eq!(word & PC_OFFSET_MASK, 0xdead_beef_cafe);
        assert_eq!((word >> 48) & 0xff, 0x05);
        assert_eq!((word >> 56) & 0xff, 0xf0);
        assert_eq!(decode(word), (0xdead_beef_cafe, 0x05, 0xf0));
    }

    #[test]
    fn test_encode_masks_wide_offsets() {
        let word = encode(u64::MAX, 1, 0);
        assert_eq!(decode(word), (PC_OFFSET_MASK, 1, 0));
    }

    #[test]
    fn test_try_save_dedup() {
        let mut traces = Traces::with_modules(test_modules());
        assert!(traces.try_save(0x10004, 1, 0));
        assert!(!traces.try_save(0x10004, 1, 0));
        assert!(traces.try_save(0x10004, 2, 0));
        assert!(traces.try_save(0x10004, 1, 1));

        let all: Vec<_> = traces.list_all().collect();
        assert_eq!(all.len(), 3);
        for (index, word) in all {
            assert_eq!(index, 0);
            assert_eq!(decode(word).0, 4);
        }
    }

    #[test]
    fn test_try_save_unknown_pc_dropped() {
        let mut traces = Traces::with_modules(test_modules());
        assert!(!traces.try_save(0x5000, 1, 0));
        assert!(!traces.try_save(0x20000, 1, 0));
        assert_eq!(traces.list_all().count(), 0);
    }

    #[test]
    fn test_records_partitioned_by_module() {
        let mut traces = Traces::with_modules(test_modules());
        assert!(traces.try_save(0x10010, 1, 0));
        assert!(traces.try_save(0x7f0000000123, 1, 0));

        assert_eq!(traces.modules_count(), 2);
        assert_eq!(traces.module_name(0), Some("host"));
        assert_eq!(traces.module_name(1), Some("lib"));

        let m0: Vec<_> = traces.module_records(0).collect();
        let m1: Vec<_> = traces.module_records(1).collect();
        assert_eq!(m0, vec![encode(0x10, 1, 0)]);
        assert_eq!(m1, vec![encode(0x123, 1, 0)]);
    }

    #[test]
    fn test_module_records_sorted() {
        let mut traces = Traces::with_modules(test_modules());
        assert!(traces.try_save(0x10f00, 1, 0));
        assert!(traces.try_save(0x10004, 2, 0));
        assert!(traces.try_save(0x10004, 1, 0));

        let words: Vec<_> = traces.module_records(0).collect();
        let mut sorted = words.clone();
        sorted.sort_unstable();
        assert_eq!(words, sorted);
    }

    #[test]
    fn test_hash32_is_deterministic() {
        // The seeds are fixed, so equal words must narrow identically on
        // every call (and, with the same crate version, in every process).
        assert_eq!(hash32(0), hash32(0));
        assert_ne!(hash32(1), hash32(2));
        let word = encode(0x1234, 2, 0);
        assert_eq!(hash32(word), hash32(word));
    }
}
