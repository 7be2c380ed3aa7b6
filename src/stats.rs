//! Protocol counters, collected while the engine runs and emitted as a
//! single structured log record at shutdown.

use slog::{Record, Result as SlogResult, Serializer, KV};

#[derive(Debug, Default, Clone)]
pub struct AodvStats {
    pub requests_initiated: u32,
    pub requests_resent: u32,
    pub requests_relayed: u32,
    pub requests_received: u32,
    pub requests_received_as_dest: u32,
    pub requests_duplicate: u32,
    pub requests_ttl_expired: u32,
    pub requests_for_local_repair: u32,
    pub requests_for_alternate_route: u32,

    pub replies_initiated_as_dest: u32,
    pub replies_initiated_as_intermediate: u32,
    pub replies_forwarded: u32,
    pub replies_received: u32,
    pub replies_received_as_source: u32,
    pub replies_received_for_local_repair: u32,
    pub gratuitous_replies_sent: u32,

    pub rerr_initiated: u32,
    pub rerr_initiated_with_n_flag: u32,
    pub rerr_forwarded: u32,
    pub rerr_forwarded_with_n_flag: u32,
    pub rerr_received: u32,
    pub rerr_received_with_n_flag: u32,
    pub rerr_discarded: u32,

    pub hellos_sent: u32,
    pub hellos_received: u32,

    pub data_initiated: u32,
    pub data_forwarded: u32,
    pub data_received: u32,
    pub data_dropped_no_route: u32,
    pub data_dropped_buffer_overflow: u32,

    pub broken_links: u32,
    pub sender_in_blacklist: u32,
    pub max_hop_exceeded: u32,

    pub seen_table_high_water: usize,
    pub seen_table_cache_hits: u64,
}

impl KV for AodvStats {
    fn serialize(&self, _rec: &Record, s: &mut dyn Serializer) -> SlogResult {
        s.emit_u32("requests_initiated", self.requests_initiated)?;
        s.emit_u32("requests_resent", self.requests_resent)?;
        s.emit_u32("requests_relayed", self.requests_relayed)?;
        s.emit_u32("requests_received", self.requests_received)?;
        s.emit_u32("requests_received_as_dest", self.requests_received_as_dest)?;
        s.emit_u32("requests_duplicate", self.requests_duplicate)?;
        s.emit_u32("requests_ttl_expired", self.requests_ttl_expired)?;
        s.emit_u32("requests_for_local_repair", self.requests_for_local_repair)?;
        s.emit_u32(
            "requests_for_alternate_route",
            self.requests_for_alternate_route,
        )?;
        s.emit_u32("replies_initiated_as_dest", self.replies_initiated_as_dest)?;
        s.emit_u32(
            "replies_initiated_as_intermediate",
            self.replies_initiated_as_intermediate,
        )?;
        s.emit_u32("replies_forwarded", self.replies_forwarded)?;
        s.emit_u32("replies_received", self.replies_received)?;
        s.emit_u32("replies_received_as_source", self.replies_received_as_source)?;
        s.emit_u32(
            "replies_received_for_local_repair",
            self.replies_received_for_local_repair,
        )?;
        s.emit_u32("gratuitous_replies_sent", self.gratuitous_replies_sent)?;
        s.emit_u32("rerr_initiated", self.rerr_initiated)?;
        s.emit_u32("rerr_initiated_with_n_flag", self.rerr_initiated_with_n_flag)?;
        s.emit_u32("rerr_forwarded", self.rerr_forwarded)?;
        s.emit_u32("rerr_forwarded_with_n_flag", self.rerr_forwarded_with_n_flag)?;
        s.emit_u32("rerr_received", self.rerr_received)?;
        s.emit_u32("rerr_received_with_n_flag", self.rerr_received_with_n_flag)?;
        s.emit_u32("rerr_discarded", self.rerr_discarded)?;
        s.emit_u32("hellos_sent", self.hellos_sent)?;
        s.emit_u32("hellos_received", self.hellos_received)?;
        s.emit_u32("data_initiated", self.data_initiated)?;
        s.emit_u32("data_forwarded", self.data_forwarded)?;
        s.emit_u32("data_received", self.data_received)?;
        s.emit_u32("data_dropped_no_route", self.data_dropped_no_route)?;
        s.emit_u32(
            "data_dropped_buffer_overflow",
            self.data_dropped_buffer_overflow,
        )?;
        s.emit_u32("broken_links", self.broken_links)?;
        s.emit_u32("sender_in_blacklist", self.sender_in_blacklist)?;
        s.emit_u32("max_hop_exceeded", self.max_hop_exceeded)?;
        s.emit_usize("seen_table_high_water", self.seen_table_high_water)?;
        s.emit_u64("seen_table_cache_hits", self.seen_table_cache_hits)
    }
}
