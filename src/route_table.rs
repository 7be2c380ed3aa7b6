//! Routing table with arena-backed entries.
//!
//! Entries live in a slot arena and are referenced by stable [`EntryId`]s
//! from three views: hash buckets keyed on the host bits of the
//! destination, an expiry list sorted by lifetime for active routes, and
//! a deletion list for disabled routes awaiting removal. The two lists
//! feed the shared expiry and deletion sweep timers.

use chrono::{DateTime, Duration, Utc};

use crate::address::Address;
use crate::config::INFINITY;

const ROUTE_HASH_BUCKETS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(usize);

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub destination: Address,
    pub dest_seq_num: u32,
    /// Hops to the destination, [`INFINITY`] while the route is disabled.
    pub hop_count: i32,
    /// Hop count the route had when it was last usable.
    pub last_hop_count: i32,
    pub interface: usize,
    pub next_hop: Address,
    pub activated: bool,
    /// Expiry while active, removal time after being disabled.
    pub lifetime: DateTime<Utc>,
    pub locally_repairable: bool,
    /// Hello sequence observed when a neighbour timeout was armed.
    pub hello_seq_num: u32,
    /// Upstream neighbours using this route, sorted by address.
    pub precursors: Vec<Address>,
}

impl RouteEntry {
    /// Milliseconds of lifetime left, zero when already past due.
    pub fn remaining_lifetime_ms(&self, now: DateTime<Utc>) -> u32 {
        let left = self.lifetime.signed_duration_since(now).num_milliseconds();
        if left > 0 {
            left as u32
        } else {
            0
        }
    }

    pub fn is_usable(&self) -> bool {
        self.activated && self.hop_count != INFINITY
    }
}

#[derive(Debug, Default)]
pub struct RouteTable {
    entries: Vec<Option<RouteEntry>>,
    free: Vec<usize>,
    buckets: Vec<Vec<EntryId>>,
    /// Active entries ordered by ascending lifetime.
    expiry: Vec<EntryId>,
    /// Disabled entries in the order they were disabled.
    deletion: Vec<EntryId>,
}

/// Outcome of a replace-or-insert, so callers can tell a brand new
/// route from a refresh of one they already had.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    Updated,
}

impl RouteTable {
    pub fn new() -> RouteTable {
        RouteTable {
            entries: Vec::new(),
            free: Vec::new(),
            buckets: vec![Vec::new(); ROUTE_HASH_BUCKETS],
            expiry: Vec::new(),
            deletion: Vec::new(),
        }
    }

    pub fn get(&self, id: EntryId) -> &RouteEntry {
        self.entries[id.0]
            .as_ref()
            .unwrap_or_else(|| panic!("stale route entry id {}", id.0))
    }

    pub fn get_mut(&mut self, id: EntryId) -> &mut RouteEntry {
        self.entries[id.0]
            .as_mut()
            .unwrap_or_else(|| panic!("stale route entry id {}", id.0))
    }

    /// Find the entry for a destination. Destinations compare on their
    /// host bits, same as the bucket ordering.
    pub fn lookup(&self, destination: &Address) -> Option<EntryId> {
        let bucket = &self.buckets[bucket_index(destination)];
        for &id in bucket {
            let dest = &self.get(id).destination;
            if same_destination(dest, destination) {
                return Some(id);
            }
            if destination.is_smaller_than(dest) {
                break;
            }
        }
        None
    }

    /// Insert a fresh route or overwrite an existing one with newer
    /// information. Lifetimes of already active routes only move forward.
    pub fn replace_insert(
        &mut self,
        destination: Address,
        dest_seq_num: u32,
        hop_count: i32,
        next_hop: Address,
        interface: usize,
        lifetime: DateTime<Utc>,
    ) -> (EntryId, UpsertOutcome) {
        if let Some(id) = self.lookup(&destination) {
            let was_active = {
                let entry = self.get_mut(id);
                let was_active = entry.activated;
                entry.dest_seq_num = dest_seq_num;
                entry.hop_count = hop_count;
                entry.next_hop = next_hop;
                entry.interface = interface;
                entry.locally_repairable = false;
                if !was_active {
                    entry.activated = true;
                    entry.lifetime = lifetime;
                } else if lifetime > entry.lifetime {
                    entry.lifetime = lifetime;
                }
                was_active
            };
            if was_active {
                self.remove_from_expiry(id);
            } else {
                self.remove_from_deletion(id);
            }
            self.insert_into_expiry(id);
            (id, UpsertOutcome::Updated)
        } else {
            let entry = RouteEntry {
                destination,
                dest_seq_num,
                hop_count,
                last_hop_count: hop_count,
                interface,
                next_hop,
                activated: true,
                lifetime,
                locally_repairable: false,
                hello_seq_num: 0,
                precursors: Vec::new(),
            };
            let id = self.allocate(entry);
            self.insert_into_bucket(id);
            self.insert_into_expiry(id);
            (id, UpsertOutcome::Added)
        }
    }

    /// Push a route's lifetime forward, reactivating it if it had been
    /// disabled. A `hop_count` of [`INFINITY`] keeps the current count,
    /// falling back to the last known one on reactivation.
    pub fn update_lifetime(
        &mut self,
        destination: &Address,
        hop_count: i32,
        lifetime: DateTime<Utc>,
    ) {
        let id = match self.lookup(destination) {
            Some(id) => id,
            None => return,
        };
        let was_active = {
            let entry = self.get_mut(id);
            let was_active = entry.activated;
            if was_active {
                if lifetime <= entry.lifetime {
                    return;
                }
                entry.lifetime = lifetime;
            } else {
                entry.activated = true;
                entry.lifetime = lifetime;
                entry.hop_count = if hop_count == INFINITY {
                    entry.last_hop_count
                } else {
                    hop_count
                };
            }
            if hop_count != INFINITY {
                entry.hop_count = hop_count;
            }
            was_active
        };
        if was_active {
            self.remove_from_expiry(id);
        } else {
            self.remove_from_deletion(id);
        }
        self.insert_into_expiry(id);
    }

    /// Take a route out of service. The entry lingers on the deletion
    /// list for `delete_period` so the sequence number stays known.
    pub fn disable(
        &mut self,
        id: EntryId,
        increment_seq: bool,
        now: DateTime<Utc>,
        delete_period: Duration,
    ) {
        self.remove_from_expiry(id);
        let entry = self.get_mut(id);
        debug_assert!(entry.activated, "disabling an already disabled route");
        entry.last_hop_count = entry.hop_count;
        entry.hop_count = INFINITY;
        entry.activated = false;
        if increment_seq {
            entry.dest_seq_num = entry.dest_seq_num.wrapping_add(1);
        }
        entry.lifetime = now + delete_period;
        entry.precursors.clear();
        self.deletion.push(id);
    }

    pub fn delete(&mut self, id: EntryId) {
        self.remove_from_deletion(id);
        self.remove_from_expiry(id);
        let bucket = {
            let entry = self.get(id);
            bucket_index(&entry.destination)
        };
        self.buckets[bucket].retain(|&other| other != id);
        self.entries[id.0] = None;
        self.free.push(id.0);
    }

    /// Disable every active route past its lifetime and report when the
    /// next one is due, if any.
    pub fn sweep_expired(
        &mut self,
        now: DateTime<Utc>,
        delete_period: Duration,
    ) -> Option<DateTime<Utc>> {
        while let Some(&id) = self.expiry.first() {
            if self.get(id).lifetime > now {
                break;
            }
            self.disable(id, true, now, delete_period);
        }
        self.next_expiry()
    }

    /// Remove every disabled route past its removal time and report when
    /// the next one is due, if any.
    pub fn sweep_deletable(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let due: Vec<EntryId> = self
            .deletion
            .iter()
            .cloned()
            .filter(|&id| self.get(id).lifetime <= now)
            .collect();
        for id in due {
            self.delete(id);
        }
        self.next_deletion()
    }

    pub fn next_expiry(&self) -> Option<DateTime<Utc>> {
        self.expiry.first().map(|&id| self.get(id).lifetime)
    }

    pub fn next_deletion(&self) -> Option<DateTime<Utc>> {
        self.deletion
            .iter()
            .map(|&id| self.get(id).lifetime)
            .min()
    }

    /// TTL to use when searching for a destination, based on the hop
    /// count the route had when it was last usable.
    pub fn last_hop_count(&self, destination: &Address, ttl_start: u32) -> u32 {
        match self.lookup(destination) {
            Some(id) => {
                let last = self.get(id).last_hop_count;
                if last > 0 {
                    last as u32
                } else {
                    ttl_start
                }
            }
            None => ttl_start,
        }
    }

    /// Last sequence number known for a destination, zero when unknown.
    pub fn seq_num(&self, destination: &Address) -> u32 {
        self.lookup(destination)
            .map(|id| self.get(id).dest_seq_num)
            .unwrap_or(0)
    }

    pub fn add_precursor(&mut self, id: EntryId, precursor: Address) {
        let list = &mut self.get_mut(id).precursors;
        match list.binary_search_by(|p| {
            if p == &precursor {
                std::cmp::Ordering::Equal
            } else if p.is_smaller_than(&precursor) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        }) {
            Ok(_) => {}
            Err(pos) => list.insert(pos, precursor),
        }
    }

    /// Drop a neighbour from every precursor list, after a link to it
    /// was reported broken.
    pub fn purge_precursor(&mut self, neighbour: &Address) {
        for slot in &mut self.entries {
            if let Some(entry) = slot {
                entry.precursors.retain(|p| p != neighbour);
            }
        }
    }

    /// Take every usable route through a broken next hop out of service
    /// and flag it as a candidate for local repair. The dead neighbour
    /// is dropped from every precursor list first, so no error can name
    /// it as an upstream.
    pub fn mark_locally_repairable(
        &mut self,
        next_hop: &Address,
        now: DateTime<Utc>,
        delete_period: Duration,
    ) {
        self.purge_precursor(next_hop);
        let affected: Vec<EntryId> = self
            .iter()
            .filter(|(_, entry)| entry.is_usable() && entry.next_hop == *next_hop)
            .map(|(id, _)| id)
            .collect();
        for id in affected {
            self.disable(id, true, now, delete_period);
            self.get_mut(id).locally_repairable = true;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &RouteEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|entry| (EntryId(idx), entry)))
    }

    /// Snapshot of every live entry id, for passes that mutate as they go.
    pub fn ids(&self) -> Vec<EntryId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn active_count(&self) -> usize {
        self.iter().filter(|(_, entry)| entry.activated).count()
    }

    fn allocate(&mut self, entry: RouteEntry) -> EntryId {
        match self.free.pop() {
            Some(idx) => {
                self.entries[idx] = Some(entry);
                EntryId(idx)
            }
            None => {
                self.entries.push(Some(entry));
                EntryId(self.entries.len() - 1)
            }
        }
    }

    fn insert_into_bucket(&mut self, id: EntryId) {
        let destination = self.get(id).destination;
        let idx = bucket_index(&destination);
        let mut pos = self.buckets[idx].len();
        for (i, &other) in self.buckets[idx].iter().enumerate() {
            if destination.is_smaller_than(&self.get(other).destination) {
                pos = i;
                break;
            }
        }
        self.buckets[idx].insert(pos, id);
    }

    fn insert_into_expiry(&mut self, id: EntryId) {
        let lifetime = self.get(id).lifetime;
        // Refreshed lifetimes usually land at the tail, so scan from there.
        let mut pos = self.expiry.len();
        while pos > 0 && self.get(self.expiry[pos - 1]).lifetime > lifetime {
            pos -= 1;
        }
        self.expiry.insert(pos, id);
    }

    fn remove_from_expiry(&mut self, id: EntryId) {
        self.expiry.retain(|&other| other != id);
    }

    fn remove_from_deletion(&mut self, id: EntryId) {
        self.deletion.retain(|&other| other != id);
    }
}

fn bucket_index(addr: &Address) -> usize {
    addr.host_bits() as usize % ROUTE_HASH_BUCKETS
}

fn same_destination(a: &Address, b: &Address) -> bool {
    a.host_bits() == b.host_bits()
}
