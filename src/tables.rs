//! Bookkeeping tables for flood suppression, outstanding route
//! searches, and blacklisted neighbours.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::address::Address;

/// Recently seen floods, kept in arrival order so each flush timer can
/// retire exactly the oldest record.
#[derive(Debug, Default)]
pub struct SeenTable {
    records: VecDeque<(Address, u32)>,
    /// Index of the last hit; repeated floods tend to probe the same record.
    last_found: Option<usize>,
    last_found_hits: u64,
    high_water: usize,
}

impl SeenTable {
    pub fn new() -> SeenTable {
        SeenTable::default()
    }

    pub fn seen(&mut self, source: &Address, flooding_id: u32) -> bool {
        if let Some(idx) = self.last_found {
            if let Some(record) = self.records.get(idx) {
                if record.0 == *source && record.1 == flooding_id {
                    self.last_found_hits += 1;
                    return true;
                }
            }
        }
        for (idx, record) in self.records.iter().enumerate() {
            if record.0 == *source && record.1 == flooding_id {
                self.last_found = Some(idx);
                return true;
            }
        }
        false
    }

    pub fn insert(&mut self, source: Address, flooding_id: u32) {
        self.records.push_back((source, flooding_id));
        if self.records.len() > self.high_water {
            self.high_water = self.records.len();
        }
    }

    /// Retire the oldest record; one flush timer is armed per insert.
    pub fn flush_oldest(&mut self) {
        self.records.pop_front();
        self.last_found = match self.last_found {
            Some(0) | None => None,
            Some(idx) => Some(idx - 1),
        };
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn last_found_hits(&self) -> u64 {
        self.last_found_hits
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SentEntry {
    /// TTL used for the most recent search round.
    pub ttl: u32,
    /// Retries made once the search reached the network diameter.
    pub times: u32,
}

/// Destinations with an outstanding route search.
#[derive(Debug, Default)]
pub struct SentTable {
    entries: HashMap<Address, SentEntry>,
}

impl SentTable {
    pub fn new() -> SentTable {
        SentTable::default()
    }

    pub fn insert(&mut self, destination: Address, ttl: u32) {
        self.entries
            .insert(destination, SentEntry { ttl, times: 0 });
    }

    pub fn contains(&self, destination: &Address) -> bool {
        self.entries.contains_key(destination)
    }

    pub fn get(&self, destination: &Address) -> Option<SentEntry> {
        self.entries.get(destination).cloned()
    }

    pub fn delete(&mut self, destination: &Address) {
        self.entries.remove(destination);
    }

    /// Expanding ring step: widen by the increment until the threshold,
    /// then jump straight to the network diameter.
    pub fn increase_ttl(
        &mut self,
        destination: &Address,
        increment: u32,
        threshold: u32,
        net_diameter: u32,
    ) {
        if let Some(entry) = self.entries.get_mut(destination) {
            entry.ttl += increment;
            if entry.ttl > threshold {
                entry.ttl = net_diameter;
            }
        }
    }

    /// Count a retry at full diameter.
    pub fn record_retry(&mut self, destination: &Address) {
        if let Some(entry) = self.entries.get_mut(destination) {
            entry.times += 1;
        }
    }
}

/// Neighbours that failed to return a requested RREP acknowledgement.
/// Their floods are ignored until the timeout clears them.
#[derive(Debug, Default)]
pub struct Blacklist {
    neighbours: HashSet<Address>,
}

impl Blacklist {
    pub fn new() -> Blacklist {
        Blacklist::default()
    }

    pub fn insert(&mut self, neighbour: Address) -> bool {
        self.neighbours.insert(neighbour)
    }

    pub fn contains(&self, neighbour: &Address) -> bool {
        self.neighbours.contains(neighbour)
    }

    pub fn remove(&mut self, neighbour: &Address) {
        self.neighbours.remove(neighbour);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn seen_table_is_fifo() {
        let mut seen = SeenTable::new();
        seen.insert(addr("10.0.0.1"), 1);
        seen.insert(addr("10.0.0.2"), 7);
        assert!(seen.seen(&addr("10.0.0.1"), 1));
        assert!(seen.seen(&addr("10.0.0.2"), 7));
        assert!(!seen.seen(&addr("10.0.0.1"), 2));

        seen.flush_oldest();
        assert!(!seen.seen(&addr("10.0.0.1"), 1));
        assert!(seen.seen(&addr("10.0.0.2"), 7));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen.high_water(), 2);
    }

    #[test]
    fn repeated_probe_hits_the_cache() {
        let mut seen = SeenTable::new();
        seen.insert(addr("10.0.0.1"), 1);
        assert!(seen.seen(&addr("10.0.0.1"), 1));
        assert!(seen.seen(&addr("10.0.0.1"), 1));
        assert_eq!(seen.last_found_hits(), 1);
    }

    #[test]
    fn expanding_ring_jumps_to_diameter_past_threshold() {
        let mut sent = SentTable::new();
        let dest = addr("10.0.0.9");
        sent.insert(dest, 1);
        sent.increase_ttl(&dest, 2, 7, 35);
        assert_eq!(sent.get(&dest).unwrap().ttl, 3);
        sent.increase_ttl(&dest, 2, 7, 35);
        assert_eq!(sent.get(&dest).unwrap().ttl, 5);
        sent.increase_ttl(&dest, 2, 7, 35);
        assert_eq!(sent.get(&dest).unwrap().ttl, 7);
        sent.increase_ttl(&dest, 2, 7, 35);
        assert_eq!(sent.get(&dest).unwrap().ttl, 35);
    }

    #[test]
    fn retries_only_count_at_full_diameter() {
        let mut sent = SentTable::new();
        let dest = addr("10.0.0.9");
        sent.insert(dest, 35);
        sent.record_retry(&dest);
        sent.record_retry(&dest);
        assert_eq!(sent.get(&dest).unwrap().times, 2);
        sent.delete(&dest);
        assert!(!sent.contains(&dest));
    }

    #[test]
    fn blacklist_membership() {
        let mut blacklist = Blacklist::new();
        assert!(blacklist.insert(addr("10.0.0.3")));
        assert!(!blacklist.insert(addr("10.0.0.3")));
        assert!(blacklist.contains(&addr("10.0.0.3")));
        blacklist.remove(&addr("10.0.0.3"));
        assert!(!blacklist.contains(&addr("10.0.0.3")));
    }
}
