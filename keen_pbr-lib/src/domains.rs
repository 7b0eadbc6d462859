//! In-memory index mapping sanitized domains to the IP sets they belong to.
//!
//! Keys are CRC32 hashes of the lower-cased domain so a large list collection
//! stays compact; the membership value is a bit vector over the configured IP
//! sets in declaration order. CRC32 collisions between distinct domains are
//! tracked and surfaced as warnings at emit time. Entries are forgotten as
//! they are written out so memory is released incrementally.

use std::collections::HashMap;

/// Membership bitmap over the ordered IP sets of one configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetBits {
    words: Vec<u64>,
}

impl SetBits {
    pub fn new(set_count: usize) -> Self {
        SetBits {
            words: vec![0; set_count.div_ceil(64)],
        }
    }

    pub fn set(&mut self, index: usize) {
        if let Some(word) = self.words.get_mut(index / 64) {
            *word |= 1 << (index % 64);
        }
    }

    pub fn get(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .is_some_and(|word| word & (1 << (index % 64)) != 0)
    }

    /// Set indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let bits = self.words.len() * 64;
        (0..bits).filter(|i| self.get(*i))
    }
}

#[derive(Debug)]
struct Slot {
    bits: SetBits,
    /// distinct lower-cased domains hashing to this slot, first-seen first
    domains: Vec<String>,
}

#[derive(Debug, Default)]
pub struct DomainIndex {
    set_count: usize,
    slots: HashMap<u32, Slot>,
    count: usize,
}

impl DomainIndex {
    pub fn new(set_count: usize) -> Self {
        DomainIndex {
            set_count,
            slots: HashMap::new(),
            count: 0,
        }
    }

    pub fn hash(domain: &str) -> u32 {
        crc32fast::hash(domain.to_lowercase().as_bytes())
    }

    /// Record that `domain` belongs to the IP set at `ipset_index`.
    pub fn associate(&mut self, domain: &str, ipset_index: usize) {
        let domain = domain.to_lowercase();
        let hash = crc32fast::hash(domain.as_bytes());

        let slot = self.slots.entry(hash).or_insert_with(|| Slot {
            bits: SetBits::new(self.set_count),
            domains: Vec::new(),
        });
        if !slot.domains.contains(&domain) {
            slot.domains.push(domain);
            self.count += 1;
        }
        slot.bits.set(ipset_index);
    }

    /// Membership bits and hash for a domain still present in the index.
    pub fn lookup(&self, domain: &str) -> Option<(&SetBits, u32)> {
        let domain = domain.to_lowercase();
        let hash = crc32fast::hash(domain.as_bytes());
        let slot = self.slots.get(&hash)?;
        slot.domains.iter().any(|d| d == &domain).then_some((&slot.bits, hash))
    }

    /// Distinct domains whose lower-cased forms share `hash`. More than one
    /// entry means a CRC32 collision; membership of the colliding domains is
    /// merged and therefore undetermined per domain.
    pub fn colliding_domains(&self, hash: u32) -> &[String] {
        self.slots.get(&hash).map(|slot| slot.domains.as_slice()).unwrap_or(&[])
    }

    /// Drop one written domain from its slot, evicting the slot once every
    /// colliding domain has been written.
    pub fn forget(&mut self, hash: u32, domain: &str) {
        let domain = domain.to_lowercase();
        if let Some(slot) = self.slots.get_mut(&hash) {
            let before = slot.domains.len();
            slot.domains.retain(|d| d != &domain);
            self.count -= before - slot.domains.len();
            if slot.domains.is_empty() {
                self.slots.remove(&hash);
            }
        }
    }

    /// Number of distinct domains currently held.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
