//! The protocol engine. One instance runs per node, owns every table,
//! and reacts to three inputs: data packets to route, received control
//! packets, and its own timers. The host drives time explicitly, so
//! the engine never blocks and never reads the clock itself.

use std::cmp;
use std::collections::BinaryHeap;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slog::Logger;

use crate::address::{Address, AddressFamily};
use crate::buffer::{DataPacket, MessageBuffer};
use crate::config::{Params, INFINITY, LOCAL_ADD_TTL};
use crate::messages::{
    AodvMessage, RouteError, RouteReply, RouteRequest, RerrFlags, RrepFlags, RreqFlags,
};
use crate::route_table::{RouteTable, UpsertOutcome};
use crate::stats::AodvStats;
use crate::tables::{Blacklist, SeenTable, SentTable};
use crate::transport::Transport;
use crate::{fresher, AodvError, DropReason};

const BROADCAST_JITTER_MS: i64 = 10;
/// Hello-based neighbour timeouts fire this many hello intervals after
/// the last hello, regardless of the allowed-loss setting.
const NEIGHBOR_TIMEOUT_INTERVALS: i32 = 4;

/// Timers the engine arms for itself. The host only has to call
/// [`AodvEngine::handle_timers`] whenever [`AodvEngine::next_deadline`]
/// comes due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// Retire the oldest seen-table record.
    FlushSeenRecord,
    /// Sweep active routes past their lifetime.
    RouteExpiry,
    /// Sweep disabled routes past their removal time.
    RouteDeletion,
    /// A route search for this destination should have produced a
    /// reply by now.
    CheckReplied(Address),
    /// Let a blacklisted neighbour back in.
    BlacklistTimeout(Address),
    /// A neighbour known through hellos went quiet; the number is the
    /// hello sequence observed when the timer was armed.
    NeighborTimeout(Address, u32),
    /// Time to consider sending a hello.
    Hello,
}

#[derive(Debug)]
struct TimerEntry {
    deadline: DateTime<Utc>,
    seq: u64,
    event: TimerEvent,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &TimerEntry) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &TimerEntry) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &TimerEntry) -> cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

/// What a failed transmission was carrying, reported by the link layer.
#[derive(Debug, Clone)]
pub enum FailedTransmission {
    Control(AodvMessage),
    Data(DataPacket),
}

pub struct AodvEngine<T: Transport> {
    params: Params,
    transport: T,
    family: AddressFamily,
    route_table: RouteTable,
    seen: SeenTable,
    sent: SentTable,
    blacklist: Blacklist,
    buffer: MessageBuffer,
    stats: AodvStats,
    /// Own destination sequence number.
    seq_number: u32,
    /// Identifier of the last flood this node originated.
    flooding_id: u32,
    last_broadcast_sent: DateTime<Utc>,
    timers: BinaryHeap<TimerEntry>,
    timer_seq: u64,
    is_expire_timer_set: bool,
    is_delete_timer_set: bool,
    rng: StdRng,
    logger: Logger,
}

impl<T: Transport> AodvEngine<T> {
    pub fn new(
        params: Params,
        transport: T,
        family: AddressFamily,
        logger: Logger,
        now: DateTime<Utc>,
    ) -> AodvEngine<T> {
        let buffer = MessageBuffer::new(params.buffer_max_packets, params.buffer_max_bytes);
        let hello_interval = params.hello_interval;
        let process_hello = params.process_hello;
        let mut engine = AodvEngine {
            params,
            transport,
            family,
            route_table: RouteTable::new(),
            seen: SeenTable::new(),
            sent: SentTable::new(),
            blacklist: Blacklist::new(),
            buffer,
            stats: AodvStats::default(),
            seq_number: 0,
            flooding_id: 0,
            last_broadcast_sent: now - hello_interval,
            timers: BinaryHeap::new(),
            timer_seq: 0,
            is_expire_timer_set: false,
            is_delete_timer_set: false,
            rng: StdRng::from_entropy(),
            logger,
        };
        if process_hello {
            let delay = engine.params.hello_interval + engine.jitter();
            engine.schedule(now + delay, TimerEvent::Hello);
        }
        info!(engine.logger, "Protocol initialized");
        engine
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn seq_number(&self) -> u32 {
        self.seq_number
    }

    /// Counter snapshot, with the seen-table figures pulled in.
    pub fn stats(&self) -> AodvStats {
        let mut stats = self.stats.clone();
        stats.seen_table_high_water = self.seen.high_water();
        stats.seen_table_cache_hits = self.seen.last_found_hits();
        stats
    }

    pub fn log_stats(&self) {
        info!(self.logger, "Protocol statistics"; self.stats());
    }

    /// Earliest pending timer, if any. The host should call
    /// [`handle_timers`](AodvEngine::handle_timers) once it passes.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.timers.peek().map(|entry| entry.deadline)
    }

    //*****************
    //Data path
    //*****************

    /// Route a data packet: one originated here goes out or triggers a
    /// route search, one received from a neighbour is forwarded or
    /// delivered.
    pub fn route_data(&mut self, packet: DataPacket, now: DateTime<Utc>) -> Result<(), AodvError> {
        if !self.transport.is_local_address(&packet.source) {
            return self.handle_incoming_data(packet, now);
        }
        if self.transport.is_local_address(&packet.destination) {
            self.transport.deliver(packet);
            return Ok(());
        }
        let destination = packet.destination;
        let usable = self
            .route_table
            .lookup(&destination)
            .filter(|&id| self.route_table.get(id).is_usable());
        if let Some(id) = usable {
            self.stats.data_initiated += 1;
            return self.transmit_data(packet, id, now);
        }
        let already_searching = self.sent.contains(&destination);
        if let Err(e) = self.buffer.insert(packet) {
            self.stats.data_dropped_buffer_overflow += 1;
            debug!(self.logger, "Data packet dropped";
                   "destination" => %destination,
                   "reason" => %e);
        }
        if !already_searching {
            self.initiate_rreq(destination, now)?;
        }
        Ok(())
    }

    fn handle_incoming_data(
        &mut self,
        packet: DataPacket,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        let active_lifetime = now + self.params.active_route_timeout;
        if self.transport.is_local_address(&packet.destination) {
            self.stats.data_received += 1;
            // The reverse path just proved itself usable. Sec 8.2
            if packet.previous_hop != packet.source {
                self.route_table
                    .update_lifetime(&packet.previous_hop, 1, active_lifetime);
            }
            self.route_table
                .update_lifetime(&packet.source, INFINITY, active_lifetime);
            self.transport.deliver(packet);
            return Ok(());
        }

        let destination = packet.destination;
        let entry = self.route_table.lookup(&destination);
        if self.params.local_repair {
            if let Some(id) = entry {
                if !self.route_table.get(id).is_usable() {
                    let ttl = {
                        let e = self.route_table.get_mut(id);
                        e.lifetime = now + self.params.delete_period;
                        cmp::max(e.last_hop_count, 1) as u32 + LOCAL_ADD_TTL
                    };
                    self.buffer_or_drop(packet);
                    return self.initiate_rreq_for_local_repair(destination, ttl, now);
                }
            }
        }
        if let Some(id) = entry.filter(|&id| self.route_table.get(id).is_usable()) {
            self.stats.data_forwarded += 1;
            return self.transmit_data(packet, id, now);
        }
        if self.sent.contains(&destination) {
            self.buffer_or_drop(packet);
            return Ok(());
        }
        if self.params.local_repair {
            if let Some(id) = entry {
                if self.route_table.get(id).locally_repairable {
                    let (next_hop, interface) = {
                        let e = self.route_table.get(id);
                        (e.next_hop, e.interface)
                    };
                    let source = packet.source;
                    self.handle_link_failure(destination, source, next_hop, interface, now)?;
                    if self.sent.contains(&destination) {
                        self.buffer_or_drop(packet);
                    } else {
                        self.stats.data_dropped_no_route += 1;
                    }
                    return Ok(());
                }
            }
        }
        // No route and nobody looking for one: tell the upstream node
        // and drop the packet.
        self.stats.data_dropped_no_route += 1;
        self.stats.rerr_initiated += 1;
        debug!(self.logger, "Data packet dropped";
               "destination" => %destination,
               "reason" => %DropReason::NoRoute);
        let seq = match self.route_table.lookup(&destination) {
            Some(id) => self.route_table.get(id).dest_seq_num,
            None => self.seq_number,
        };
        let previous_hop = packet.previous_hop;
        self.send_rerr(
            vec![(destination, seq)],
            RerrFlags::empty(),
            Some((previous_hop, 0)),
        )
    }

    fn buffer_or_drop(&mut self, packet: DataPacket) {
        let destination = packet.destination;
        if let Err(e) = self.buffer.insert(packet) {
            self.stats.data_dropped_buffer_overflow += 1;
            debug!(self.logger, "Data packet dropped";
                   "destination" => %destination,
                   "reason" => %e);
        }
    }

    fn transmit_data(
        &mut self,
        packet: DataPacket,
        id: crate::route_table::EntryId,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        let (next_hop, interface) = {
            let entry = self.route_table.get(id);
            (entry.next_hop, entry.interface)
        };
        let active_lifetime = now + self.params.active_route_timeout;
        let previous_hop = packet.previous_hop;
        let source = packet.source;
        self.transport.send_data(packet, next_hop, interface)?;
        // Sec 8.2: forwarding refreshes the route, its next hop, and
        // the reverse path the packet arrived on.
        if !previous_hop.is_zero() && !self.transport.is_local_address(&previous_hop) {
            self.route_table
                .update_lifetime(&previous_hop, 1, active_lifetime);
        }
        if previous_hop != source && !self.transport.is_local_address(&source) {
            self.route_table
                .update_lifetime(&source, INFINITY, active_lifetime);
        }
        self.route_table
            .update_lifetime(&next_hop, 1, active_lifetime);
        self.ensure_expiry_timer(now);
        Ok(())
    }

    //*****************
    //Control path
    //*****************

    /// Decode and process a received control packet. `ttl` is the hop
    /// budget the packet arrived with.
    pub fn handle_control(
        &mut self,
        data: &[u8],
        sender: Address,
        interface: usize,
        ttl: u32,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        let msg = AodvMessage::from_bytes(data, self.family)?;
        self.handle_message(msg, sender, interface, ttl, now)
    }

    pub fn handle_message(
        &mut self,
        msg: AodvMessage,
        sender: Address,
        interface: usize,
        ttl: u32,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        match msg {
            AodvMessage::Rreq(rreq) => self.process_route_request(rreq, sender, interface, ttl, now),
            AodvMessage::Rrep(rrep) => self.process_route_reply(rrep, sender, interface, now),
            AodvMessage::Rerr(rerr) => self.process_route_error(rerr, sender, interface, now),
            AodvMessage::RrepAck => {
                debug!(self.logger, "Reply acknowledged"; "sender" => %sender);
                Ok(())
            }
        }
    }

    fn process_route_request(
        &mut self,
        rreq: RouteRequest,
        sender: Address,
        interface: usize,
        ttl: u32,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        self.stats.requests_received += 1;
        if self.blacklist.contains(&sender) {
            self.stats.sender_in_blacklist += 1;
            debug!(self.logger, "Request dropped";
                   "reason" => %DropReason::BlacklistedSender,
                   "sender" => %sender);
            return Ok(());
        }
        if u32::from(rreq.hop_count) > self.params.net_diameter {
            self.stats.max_hop_exceeded += 1;
            return Ok(());
        }
        if self.seen.seen(&rreq.originator, rreq.flooding_id) {
            self.stats.requests_duplicate += 1;
            debug!(self.logger, "Request dropped";
                   "reason" => %DropReason::Duplicate,
                   "originator" => %rreq.originator,
                   "flooding_id" => rreq.flooding_id);
            return Ok(());
        }
        self.record_seen(rreq.originator, rreq.flooding_id, now);

        let hop = i32::from(rreq.hop_count) + 1;
        let is_destination = self.transport.is_local_address(&rreq.destination);

        // Create or refresh the reverse route to the originator.
        let reverse_lifetime = if is_destination {
            now + self.params.active_route_timeout
        } else {
            now + self.params.rev_route_life
                - self.params.node_traversal_time * i32::from(rreq.hop_count)
        };
        let reverse_updated = {
            let current = self.route_table.lookup(&rreq.originator);
            match current {
                None => true,
                Some(id) => {
                    let entry = self.route_table.get(id);
                    fresher(rreq.orig_seq, entry.dest_seq_num)
                        || (rreq.orig_seq == entry.dest_seq_num
                            && (!entry.is_usable() || entry.hop_count > hop))
                }
            }
        };
        let mut reverse_id = None;
        if reverse_updated {
            let (id, _) = self.route_table.replace_insert(
                rreq.originator,
                rreq.orig_seq,
                hop,
                sender,
                interface,
                reverse_lifetime,
            );
            reverse_id = Some(id);
            self.sent.delete(&rreq.originator);
            self.flush_buffer(rreq.originator, id, false, now)?;
        }

        if rreq.originator != sender {
            self.refresh_neighbor(sender, interface, now);
        }
        self.ensure_expiry_timer(now);

        if is_destination {
            self.stats.requests_received_as_dest += 1;
            if fresher(rreq.dest_seq, self.seq_number) {
                self.seq_number = rreq.dest_seq;
            }
            return self.initiate_rrep(&rreq, sender, interface);
        }

        // An intermediate node replies when it holds a route at least
        // as fresh as the one being asked for.
        let reply_candidate = if rreq.flags.contains(RreqFlags::DESTINATION_ONLY) {
            None
        } else {
            self.route_table.lookup(&rreq.destination).filter(|&id| {
                let entry = self.route_table.get(id);
                entry.is_usable() && !fresher(rreq.dest_seq, entry.dest_seq_num)
            })
        };
        if let Some(dest_id) = reply_candidate {
            let (dest_hops, dest_next_hop) = {
                let entry = self.route_table.get(dest_id);
                (entry.hop_count, entry.next_hop)
            };
            if hop + dest_hops > self.params.net_diameter as i32 {
                self.stats.max_hop_exceeded += 1;
                return Ok(());
            }
            self.route_table.add_precursor(dest_id, sender);
            if let Some(rev_id) = reverse_id.or_else(|| self.route_table.lookup(&rreq.originator)) {
                self.route_table.add_precursor(rev_id, dest_next_hop);
            }
            if rreq.flags.contains(RreqFlags::GRATUITOUS_RREP) {
                self.send_gratuitous_rrep(&rreq, dest_id, now)?;
            }
            return self.initiate_rrep_by_intermediate(&rreq, dest_id, sender, interface, now);
        }

        if ttl > 1 {
            self.relay_rreq(rreq, ttl, now)
        } else {
            self.stats.requests_ttl_expired += 1;
            debug!(self.logger, "Request dropped";
                   "reason" => %DropReason::TtlExceeded,
                   "destination" => %rreq.destination);
            Ok(())
        }
    }

    fn process_route_reply(
        &mut self,
        rrep: RouteReply,
        sender: Address,
        interface: usize,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        if rrep.is_hello() {
            return self.process_hello(rrep, interface, now);
        }
        if rrep.flags.contains(RrepFlags::ACK_REQUIRED) {
            self.transport.unicast_control(
                &AodvMessage::RrepAck,
                sender,
                interface,
                1,
                Duration::zero(),
            )?;
        }
        let hop = i32::from(rrep.hop_count) + 1;
        if hop > self.params.net_diameter as i32 {
            self.stats.max_hop_exceeded += 1;
            return Ok(());
        }
        if rrep.lifetime_ms == 0 {
            debug!(self.logger, "Reply dropped";
                   "reason" => %DropReason::StaleControlMessage,
                   "destination" => %rrep.destination);
            return Ok(());
        }
        self.stats.replies_received += 1;
        if rrep.destination != sender {
            self.refresh_neighbor(sender, interface, now);
        }

        let was_repairing = self
            .route_table
            .lookup(&rrep.destination)
            .map(|id| self.route_table.get(id).locally_repairable)
            .unwrap_or(false);
        let previous_last_hop_count = self
            .route_table
            .lookup(&rrep.destination)
            .map(|id| self.route_table.get(id).last_hop_count)
            .unwrap_or(INFINITY);

        let forward_updated = {
            match self.route_table.lookup(&rrep.destination) {
                None => true,
                Some(id) => {
                    let entry = self.route_table.get(id);
                    fresher(rrep.dest_seq, entry.dest_seq_num)
                        || (rrep.dest_seq == entry.dest_seq_num
                            && (!entry.is_usable() || entry.hop_count > hop))
                }
            }
        };
        let mut forward_id = None;
        if forward_updated {
            let lifetime = now + Duration::milliseconds(i64::from(rrep.lifetime_ms));
            let (id, outcome) = self.route_table.replace_insert(
                rrep.destination,
                rrep.dest_seq,
                hop,
                sender,
                interface,
                lifetime,
            );
            forward_id = Some(id);
            if outcome == UpsertOutcome::Added {
                info!(self.logger, "Route added";
                      "destination" => %rrep.destination,
                      "next_hop" => %sender,
                      "hop_count" => hop);
            }
            self.ensure_expiry_timer(now);
        }

        if was_repairing {
            // A repair round came back. Resume the flow and warn the
            // sources if the repaired path got longer. A reply that did
            // not better the route settles nothing.
            if let Some(id) = forward_id {
                self.stats.replies_received_for_local_repair += 1;
                self.route_table.get_mut(id).locally_repairable = false;
                self.sent.delete(&rrep.destination);
                self.flush_buffer(rrep.destination, id, false, now)?;
                if previous_last_hop_count != INFINITY
                    && self.route_table.get(id).hop_count > previous_last_hop_count
                {
                    self.stats.rerr_initiated_with_n_flag += 1;
                    let seq = self.route_table.get(id).dest_seq_num;
                    self.send_rerr(
                        vec![(rrep.destination, seq)],
                        RerrFlags::NO_DELETE,
                        None,
                    )?;
                }
            }
            return Ok(());
        }

        if self.transport.is_local_address(&rrep.originator) {
            // Only a reply that added or bettered the route ends the
            // search; a stale one must not release buffered data.
            if let Some(id) = forward_id {
                self.stats.replies_received_as_source += 1;
                self.sent.delete(&rrep.destination);
                self.flush_buffer(rrep.destination, id, true, now)?;
            }
            return Ok(());
        }

        if let Some(id) = forward_id {
            return self.relay_rrep(rrep, id, now);
        }
        Ok(())
    }

    fn process_hello(
        &mut self,
        rrep: RouteReply,
        interface: usize,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        self.stats.hellos_received += 1;
        let neighbor = rrep.destination;
        let (id, _) = self.route_table.replace_insert(
            neighbor,
            rrep.dest_seq,
            1,
            neighbor,
            interface,
            now + self.params.active_route_timeout,
        );
        // Liveness tracking is optional; the one-hop route is not.
        if self.params.process_hello {
            let hello_seq = {
                let entry = self.route_table.get_mut(id);
                entry.hello_seq_num = entry.hello_seq_num.wrapping_add(1);
                entry.hello_seq_num
            };
            self.schedule(
                now + self.params.hello_interval * NEIGHBOR_TIMEOUT_INTERVALS,
                TimerEvent::NeighborTimeout(neighbor, hello_seq),
            );
        }
        self.ensure_expiry_timer(now);
        Ok(())
    }

    fn process_route_error(
        &mut self,
        rerr: RouteError,
        sender: Address,
        interface: usize,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        self.refresh_neighbor(sender, interface, now);
        if rerr.flags.contains(RerrFlags::NO_DELETE) {
            self.stats.rerr_received_with_n_flag += 1;
            return self.process_route_error_no_delete(rerr, sender, now);
        }
        self.stats.rerr_received += 1;

        // Disable every listed route that actually goes through the
        // sender, collecting the ones other nodes still care about.
        let mut forward: Vec<(Address, u32)> = Vec::new();
        let mut upstreams: Vec<Address> = Vec::new();
        for (destination, seq) in &rerr.destinations {
            let id = match self.route_table.lookup(destination) {
                Some(id) => id,
                None => continue,
            };
            let affected = {
                let entry = self.route_table.get(id);
                entry.is_usable() && entry.next_hop == sender
            };
            if !affected {
                continue;
            }
            {
                let entry = self.route_table.get_mut(id);
                entry.dest_seq_num = *seq;
            }
            let precursors = self.route_table.get(id).precursors.clone();
            if !precursors.is_empty() {
                forward.push((*destination, *seq));
                for p in precursors {
                    if !upstreams.contains(&p) {
                        upstreams.push(p);
                    }
                }
            }
            self.route_table
                .disable(id, false, now, self.params.delete_period);
            self.ensure_delete_timer();
        }

        if !forward.is_empty() {
            self.stats.rerr_forwarded += 1;
            let target = if upstreams.len() == 1 {
                Some((upstreams[0], interface))
            } else {
                None
            };
            return self.send_rerr(forward, RerrFlags::empty(), target);
        }
        Ok(())
    }

    fn process_route_error_no_delete(
        &mut self,
        rerr: RouteError,
        sender: Address,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        for (destination, seq) in &rerr.destinations {
            let id = match self.route_table.lookup(destination) {
                Some(id) => id,
                None => {
                    self.stats.rerr_discarded += 1;
                    continue;
                }
            };
            let (via_sender, precursors) = {
                let entry = self.route_table.get(id);
                (entry.next_hop == sender, entry.precursors.clone())
            };
            if !via_sender {
                self.stats.rerr_discarded += 1;
                continue;
            }
            if precursors.is_empty() {
                if self.params.search_better_route {
                    // Repaired route got worse; look for a better one.
                    self.stats.requests_for_alternate_route += 1;
                    if self.route_table.get(id).is_usable() {
                        self.route_table
                            .disable(id, true, now, self.params.delete_period);
                        self.ensure_delete_timer();
                    }
                    self.initiate_rreq(*destination, now)?;
                } else {
                    self.stats.rerr_discarded += 1;
                }
            } else {
                self.stats.rerr_forwarded_with_n_flag += 1;
                let target = if precursors.len() == 1 {
                    let interface = self.route_table.get(id).interface;
                    Some((precursors[0], interface))
                } else {
                    None
                };
                self.send_rerr(vec![(*destination, *seq)], RerrFlags::NO_DELETE, target)?;
            }
        }
        Ok(())
    }

    //*****************
    //Route discovery
    //*****************

    fn initiate_rreq(&mut self, destination: Address, now: DateTime<Utc>) -> Result<(), AodvError> {
        let ttl = cmp::max(
            1,
            self.route_table
                .last_hop_count(&destination, self.params.ttl_start),
        );
        self.seq_number = self.seq_number.wrapping_add(1);
        self.flooding_id = self.flooding_id.wrapping_add(1);
        let mut flags = RreqFlags::empty();
        if self.params.bidirectional_connection {
            flags |= RreqFlags::GRATUITOUS_RREP;
        }
        if self.params.dest_only {
            flags |= RreqFlags::DESTINATION_ONLY;
        }
        let rreq = RouteRequest {
            flags,
            hop_count: 0,
            flooding_id: self.flooding_id,
            destination,
            dest_seq: self.route_table.seq_num(&destination),
            originator: self.transport.local_address(0),
            orig_seq: self.seq_number,
        };
        let wait = self.params.node_traversal_time * (2 * ttl as i32);
        self.sent.insert(destination, ttl);
        info!(self.logger, "Initiated route request";
              "destination" => %destination,
              "flooding_id" => self.flooding_id,
              "ttl" => ttl);
        self.flood_rreq(rreq, ttl, wait, false, now)?;
        self.sent.increase_ttl(
            &destination,
            self.params.ttl_increment,
            self.params.ttl_threshold,
            self.params.net_diameter,
        );
        self.stats.requests_initiated += 1;
        Ok(())
    }

    fn initiate_rreq_for_local_repair(
        &mut self,
        destination: Address,
        ttl: u32,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        self.seq_number = self.seq_number.wrapping_add(1);
        self.flooding_id = self.flooding_id.wrapping_add(1);
        let rreq = RouteRequest {
            flags: RreqFlags::empty(),
            hop_count: 0,
            flooding_id: self.flooding_id,
            destination,
            dest_seq: self.route_table.seq_num(&destination).wrapping_add(1),
            originator: self.transport.local_address(0),
            orig_seq: self.seq_number,
        };
        let wait = self.params.net_traversal_time;
        self.sent.insert(destination, ttl);
        info!(self.logger, "Initiated local repair";
              "destination" => %destination,
              "ttl" => ttl);
        self.flood_rreq(rreq, ttl, wait, false, now)?;
        self.stats.requests_for_local_repair += 1;
        Ok(())
    }

    fn retry_rreq(&mut self, destination: Address, now: DateTime<Utc>) -> Result<(), AodvError> {
        let sent_entry = match self.sent.get(&destination) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        let ttl = sent_entry.ttl;
        self.flooding_id = self.flooding_id.wrapping_add(1);
        let mut flags = RreqFlags::empty();
        if self.params.bidirectional_connection {
            flags |= RreqFlags::GRATUITOUS_RREP;
        }
        if self.params.dest_only {
            flags |= RreqFlags::DESTINATION_ONLY;
        }
        let rreq = RouteRequest {
            flags,
            hop_count: 0,
            flooding_id: self.flooding_id,
            destination,
            dest_seq: self.route_table.seq_num(&destination),
            originator: self.transport.local_address(0),
            orig_seq: self.seq_number,
        };
        let wait = self.params.node_traversal_time * (2 * ttl as i32);
        debug!(self.logger, "Resending route request";
               "destination" => %destination,
               "ttl" => ttl);
        self.flood_rreq(rreq, ttl, wait, false, now)?;
        if ttl >= self.params.net_diameter {
            self.sent.record_retry(&destination);
        }
        self.sent.increase_ttl(
            &destination,
            self.params.ttl_increment,
            self.params.ttl_threshold,
            self.params.net_diameter,
        );
        self.stats.requests_resent += 1;
        Ok(())
    }

    fn relay_rreq(
        &mut self,
        mut rreq: RouteRequest,
        ttl: u32,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        rreq.hop_count += 1;
        let table_seq = self.route_table.seq_num(&rreq.destination);
        if fresher(table_seq, rreq.dest_seq) {
            rreq.dest_seq = table_seq;
        }
        self.flood_rreq(rreq, ttl - 1, Duration::zero(), true, now)?;
        self.stats.requests_relayed += 1;
        Ok(())
    }

    fn flood_rreq(
        &mut self,
        rreq: RouteRequest,
        ttl: u32,
        wait: Duration,
        is_relay: bool,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        let msg = AodvMessage::Rreq(rreq.clone());
        for interface in 0..self.transport.interface_count() {
            let delay = self.jitter();
            self.transport.broadcast_control(&msg, interface, ttl, delay)?;
        }
        if !is_relay {
            self.record_seen(rreq.originator, rreq.flooding_id, now);
        }
        self.last_broadcast_sent = now;
        if wait > Duration::zero() {
            self.schedule(now + wait, TimerEvent::CheckReplied(rreq.destination));
        }
        Ok(())
    }

    //*****************
    //Route replies
    //*****************

    fn initiate_rrep(
        &mut self,
        rreq: &RouteRequest,
        sender: Address,
        interface: usize,
    ) -> Result<(), AodvError> {
        let mut flags = RrepFlags::empty();
        if self.params.process_rrep_ack {
            flags |= RrepFlags::ACK_REQUIRED;
        }
        let rrep = RouteReply {
            flags,
            prefix_size: 0,
            hop_count: 0,
            destination: self.transport.local_address(interface),
            dest_seq: self.seq_number,
            originator: rreq.originator,
            lifetime_ms: self.params.my_route_timeout.num_milliseconds() as u32,
        };
        info!(self.logger, "Replying as destination";
              "originator" => %rreq.originator,
              "next_hop" => %sender);
        self.transport.unicast_control(
            &AodvMessage::Rrep(rrep),
            sender,
            interface,
            1,
            Duration::zero(),
        )?;
        self.stats.replies_initiated_as_dest += 1;
        Ok(())
    }

    fn initiate_rrep_by_intermediate(
        &mut self,
        rreq: &RouteRequest,
        dest_id: crate::route_table::EntryId,
        sender: Address,
        interface: usize,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        let (dest_seq, hop_count, lifetime_ms) = {
            let entry = self.route_table.get(dest_id);
            (
                entry.dest_seq_num,
                entry.hop_count,
                entry.remaining_lifetime_ms(now),
            )
        };
        if lifetime_ms == 0 {
            return Ok(());
        }
        let rrep = RouteReply {
            flags: RrepFlags::empty(),
            prefix_size: 0,
            hop_count: hop_count as u8,
            destination: rreq.destination,
            dest_seq,
            originator: rreq.originator,
            lifetime_ms,
        };
        info!(self.logger, "Replying as intermediate";
              "destination" => %rreq.destination,
              "originator" => %rreq.originator);
        self.transport.unicast_control(
            &AodvMessage::Rrep(rrep),
            sender,
            interface,
            1,
            Duration::zero(),
        )?;
        self.stats.replies_initiated_as_intermediate += 1;
        // Sec 6.7: forwarding a reply refreshes the reverse route used.
        self.route_table
            .update_lifetime(&sender, hop_count, now + self.params.active_route_timeout);
        Ok(())
    }

    /// Let the queried destination learn the route back to the node
    /// that answered on its behalf.
    fn send_gratuitous_rrep(
        &mut self,
        rreq: &RouteRequest,
        dest_id: crate::route_table::EntryId,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        let src_id = match self.route_table.lookup(&rreq.originator) {
            Some(id) => id,
            None => return Ok(()),
        };
        let (src_hop_count, src_lifetime_ms) = {
            let entry = self.route_table.get(src_id);
            (entry.hop_count, entry.remaining_lifetime_ms(now))
        };
        if src_lifetime_ms == 0 {
            return Ok(());
        }
        let (dest_next_hop, dest_interface) = {
            let entry = self.route_table.get(dest_id);
            (entry.next_hop, entry.interface)
        };
        let rrep = RouteReply {
            flags: RrepFlags::empty(),
            prefix_size: 0,
            hop_count: src_hop_count as u8,
            destination: rreq.originator,
            dest_seq: rreq.orig_seq,
            originator: rreq.destination,
            lifetime_ms: src_lifetime_ms,
        };
        self.transport.unicast_control(
            &AodvMessage::Rrep(rrep),
            dest_next_hop,
            dest_interface,
            1,
            Duration::zero(),
        )?;
        self.stats.gratuitous_replies_sent += 1;
        Ok(())
    }

    fn relay_rrep(
        &mut self,
        mut rrep: RouteReply,
        forward_id: crate::route_table::EntryId,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        let src_id = match self.route_table.lookup(&rrep.originator) {
            Some(id) => id,
            None => return Ok(()),
        };
        let (src_next_hop, src_interface) = {
            let entry = self.route_table.get(src_id);
            (entry.next_hop, entry.interface)
        };
        rrep.hop_count += 1;
        rrep.flags = if self.params.process_rrep_ack {
            RrepFlags::ACK_REQUIRED
        } else {
            RrepFlags::empty()
        };
        self.route_table.add_precursor(forward_id, src_next_hop);
        self.transport.unicast_control(
            &AodvMessage::Rrep(rrep),
            src_next_hop,
            src_interface,
            1,
            Duration::zero(),
        )?;
        self.stats.replies_forwarded += 1;
        // Sec 6.7: the reverse route used to forward a reply stays alive.
        self.route_table
            .update_lifetime(&src_next_hop, 1, now + self.params.active_route_timeout);
        Ok(())
    }

    //*****************
    //Route errors and link failures
    //*****************

    /// Report from the link layer that a transmission to `next_hop`
    /// failed.
    pub fn link_failure(
        &mut self,
        next_hop: Address,
        failed: FailedTransmission,
        interface: usize,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        self.stats.broken_links += 1;
        if next_hop.is_zero() {
            return Ok(());
        }
        match failed {
            FailedTransmission::Control(AodvMessage::Rrep(_)) => {
                // A lost reply means the reverse link is one-way; keep
                // that neighbour's floods out until the timeout.
                if self.blacklist.insert(next_hop) {
                    warn!(self.logger, "Neighbour blacklisted"; "neighbour" => %next_hop);
                    self.schedule(
                        now + self.params.blacklist_timeout,
                        TimerEvent::BlacklistTimeout(next_hop),
                    );
                }
                Ok(())
            }
            FailedTransmission::Control(_) => Ok(()),
            FailedTransmission::Data(packet) => {
                let destination = packet.destination;
                let source = packet.source;
                self.handle_link_failure(destination, source, next_hop, interface, now)
            }
        }
    }

    fn handle_link_failure(
        &mut self,
        destination: Address,
        source: Address,
        next_hop: Address,
        interface: usize,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        if !self.params.local_repair {
            return self.send_rerr_for_link_failure(next_hop, interface, now);
        }
        self.route_table
            .mark_locally_repairable(&next_hop, now, self.params.delete_period);
        self.ensure_delete_timer();
        let last_hop_count = self
            .route_table
            .lookup(&destination)
            .map(|id| self.route_table.get(id).last_hop_count)
            .unwrap_or(INFINITY);

        // Repair locally when the break is close to the destination,
        // far enough from the source to be worth hiding.
        if !self.transport.is_local_address(&source)
            && last_hop_count != INFINITY
            && (last_hop_count as u32) < self.params.max_repair_ttl
        {
            let source_route = self
                .route_table
                .lookup(&source)
                .filter(|&id| self.route_table.get(id).is_usable());
            if let Some(src_id) = source_route {
                let src_hops = self.route_table.get(src_id).hop_count as u32;
                let ttl = cmp::max(last_hop_count as u32, src_hops / 2) + LOCAL_ADD_TTL;
                if ttl >= src_hops {
                    // Repair would reach the source anyway; let it
                    // restart discovery itself.
                    let seq = self.route_table.seq_num(&destination);
                    self.stats.rerr_initiated += 1;
                    self.send_rerr(vec![(destination, seq)], RerrFlags::empty(), None)?;
                    self.clear_repairable(&destination);
                    return Ok(());
                }
                return self.initiate_rreq_for_local_repair(destination, ttl, now);
            }
        }

        if !self.sent.contains(&destination) {
            let repairable = self
                .route_table
                .lookup(&destination)
                .map(|id| self.route_table.get(id).locally_repairable)
                .unwrap_or(false);
            if !repairable {
                self.send_rerr_for_link_failure(next_hop, interface, now)?;
            } else {
                let seq = self.route_table.seq_num(&destination);
                self.stats.rerr_initiated += 1;
                self.send_rerr(
                    vec![(destination, seq)],
                    RerrFlags::empty(),
                    Some((next_hop, interface)),
                )?;
            }
        }
        self.clear_repairable(&destination);
        Ok(())
    }

    fn clear_repairable(&mut self, destination: &Address) {
        if let Some(id) = self.route_table.lookup(destination) {
            self.route_table.get_mut(id).locally_repairable = false;
        }
    }

    /// Invalidate every route through a broken neighbour and tell the
    /// nodes still using them.
    fn send_rerr_for_link_failure(
        &mut self,
        next_hop: Address,
        interface: usize,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        self.route_table.purge_precursor(&next_hop);
        let mut unreachable: Vec<(Address, u32)> = Vec::new();
        let mut upstreams: Vec<Address> = Vec::new();
        for (_, entry) in self.route_table.iter() {
            if entry.is_usable() && entry.next_hop == next_hop {
                if !entry.precursors.is_empty() {
                    unreachable.push((entry.destination, entry.dest_seq_num.wrapping_add(1)));
                    for p in &entry.precursors {
                        if !upstreams.contains(p) {
                            upstreams.push(*p);
                        }
                    }
                }
            }
        }
        if !unreachable.is_empty() {
            self.stats.rerr_initiated += 1;
            let target = if upstreams.len() == 1 {
                Some((upstreams[0], interface))
            } else {
                None
            };
            self.send_rerr(unreachable, RerrFlags::empty(), target)?;
        }
        // Now take the broken routes out of service.
        for id in self.route_table.ids() {
            let affected = {
                let entry = self.route_table.get(id);
                entry.is_usable() && entry.next_hop == next_hop
            };
            if affected {
                self.route_table
                    .disable(id, true, now, self.params.delete_period);
            }
        }
        self.ensure_delete_timer();
        Ok(())
    }

    /// Build and send a route error. A single known upstream gets a
    /// unicast, everyone else a one-hop broadcast on all interfaces.
    fn send_rerr(
        &mut self,
        destinations: Vec<(Address, u32)>,
        flags: RerrFlags,
        target: Option<(Address, usize)>,
    ) -> Result<(), AodvError> {
        let msg = AodvMessage::Rerr(RouteError {
            flags,
            destinations,
        });
        match target {
            Some((next_hop, interface)) => {
                let delay = self.jitter();
                self.transport
                    .unicast_control(&msg, next_hop, interface, 1, delay)
            }
            None => {
                for interface in 0..self.transport.interface_count() {
                    let delay = self.jitter();
                    self.transport.broadcast_control(&msg, interface, 1, delay)?;
                }
                Ok(())
            }
        }
    }

    //*****************
    //Timers
    //*****************

    /// Run every timer due at `now`.
    pub fn handle_timers(&mut self, now: DateTime<Utc>) -> Result<(), AodvError> {
        loop {
            let due = match self.timers.peek() {
                Some(entry) if entry.deadline <= now => true,
                _ => false,
            };
            if !due {
                return Ok(());
            }
            let entry = match self.timers.pop() {
                Some(entry) => entry,
                None => return Ok(()),
            };
            self.handle_timer_event(entry.event, now)?;
        }
    }

    fn handle_timer_event(
        &mut self,
        event: TimerEvent,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        match event {
            TimerEvent::FlushSeenRecord => {
                self.seen.flush_oldest();
                Ok(())
            }
            TimerEvent::RouteExpiry => {
                self.is_expire_timer_set = false;
                let next = self
                    .route_table
                    .sweep_expired(now, self.params.delete_period);
                self.ensure_delete_timer();
                if let Some(deadline) = next {
                    self.is_expire_timer_set = true;
                    self.schedule(deadline, TimerEvent::RouteExpiry);
                }
                Ok(())
            }
            TimerEvent::RouteDeletion => {
                self.is_delete_timer_set = false;
                if let Some(deadline) = self.route_table.sweep_deletable(now) {
                    self.is_delete_timer_set = true;
                    self.schedule(deadline, TimerEvent::RouteDeletion);
                }
                Ok(())
            }
            TimerEvent::CheckReplied(destination) => self.check_replied(destination, now),
            TimerEvent::BlacklistTimeout(neighbour) => {
                self.blacklist.remove(&neighbour);
                Ok(())
            }
            TimerEvent::NeighborTimeout(neighbour, hello_seq) => {
                let silent = self
                    .route_table
                    .lookup(&neighbour)
                    .map(|id| self.route_table.get(id).hello_seq_num == hello_seq)
                    .unwrap_or(false);
                if self.params.process_hello && silent {
                    self.stats.broken_links += 1;
                    warn!(self.logger, "Neighbour went silent"; "neighbour" => %neighbour);
                    self.send_rerr_for_link_failure(neighbour, 0, now)?;
                }
                Ok(())
            }
            TimerEvent::Hello => self.hello_tick(now),
        }
    }

    fn check_replied(
        &mut self,
        destination: Address,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        let sent_entry = match self.sent.get(&destination) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        let repair_failed = self
            .route_table
            .lookup(&destination)
            .map(|id| {
                let entry = self.route_table.get(id);
                entry.locally_repairable && !entry.is_usable()
            })
            .unwrap_or(false);
        if repair_failed {
            self.clear_repairable(&destination);
            self.sent.delete(&destination);
            let dropped = self.buffer.drop_all(&destination);
            self.stats.data_dropped_no_route += dropped as u32;
            let seq = self.route_table.seq_num(&destination);
            self.stats.rerr_initiated += 1;
            return self.send_rerr(vec![(destination, seq)], RerrFlags::empty(), None);
        }
        if sent_entry.times <= self.params.rreq_retries {
            self.retry_rreq(destination, now)
        } else {
            info!(self.logger, "Route search gave up"; "destination" => %destination);
            let dropped = self.buffer.drop_all(&destination);
            self.stats.data_dropped_no_route += dropped as u32;
            self.sent.delete(&destination);
            Ok(())
        }
    }

    fn hello_tick(&mut self, now: DateTime<Utc>) -> Result<(), AodvError> {
        // Only hello when nothing else has been broadcast lately.
        if self.last_broadcast_sent <= now - self.params.hello_interval {
            for interface in 0..self.transport.interface_count() {
                let hello = RouteReply {
                    flags: RrepFlags::empty(),
                    prefix_size: 0,
                    hop_count: 0,
                    destination: self.transport.local_address(interface),
                    dest_seq: self.seq_number,
                    originator: Address::zero(self.family),
                    lifetime_ms: self.params.active_route_timeout.num_milliseconds() as u32,
                };
                let delay = self.jitter();
                self.transport
                    .broadcast_control(&AodvMessage::Rrep(hello), interface, 1, delay)?;
            }
            self.stats.hellos_sent += 1;
            self.last_broadcast_sent = now;
        }
        let delay = self.params.hello_interval + self.jitter();
        self.schedule(now + delay, TimerEvent::Hello);
        Ok(())
    }

    //*****************
    //Internals
    //*****************

    fn schedule(&mut self, deadline: DateTime<Utc>, event: TimerEvent) {
        self.timer_seq += 1;
        self.timers.push(TimerEntry {
            deadline,
            seq: self.timer_seq,
            event,
        });
    }

    fn jitter(&mut self) -> Duration {
        Duration::milliseconds(self.rng.gen_range(0..BROADCAST_JITTER_MS))
    }

    fn record_seen(&mut self, originator: Address, flooding_id: u32, now: DateTime<Utc>) {
        self.seen.insert(originator, flooding_id);
        self.schedule(
            now + self.params.flood_record_time,
            TimerEvent::FlushSeenRecord,
        );
    }

    /// Keep a one-hop route to a neighbour we just heard from.
    fn refresh_neighbor(&mut self, neighbour: Address, interface: usize, now: DateTime<Utc>) {
        let lifetime = now + self.params.active_route_timeout;
        if self.route_table.lookup(&neighbour).is_some() {
            self.route_table.update_lifetime(&neighbour, 1, lifetime);
        } else {
            self.route_table
                .replace_insert(neighbour, 0, 1, neighbour, interface, lifetime);
        }
        self.ensure_expiry_timer(now);
    }

    /// Send everything buffered for a destination down its new route.
    fn flush_buffer(
        &mut self,
        destination: Address,
        id: crate::route_table::EntryId,
        originated_here: bool,
        now: DateTime<Utc>,
    ) -> Result<(), AodvError> {
        while let Some(packet) = self.buffer.take_next(&destination) {
            if originated_here {
                self.stats.data_initiated += 1;
            } else {
                self.stats.data_forwarded += 1;
            }
            self.transmit_data(packet, id, now)?;
        }
        Ok(())
    }

    fn ensure_expiry_timer(&mut self, now: DateTime<Utc>) {
        if !self.is_expire_timer_set {
            if let Some(deadline) = self.route_table.next_expiry() {
                self.is_expire_timer_set = true;
                self.schedule(cmp::max(deadline, now), TimerEvent::RouteExpiry);
            }
        }
    }

    fn ensure_delete_timer(&mut self) {
        if !self.is_delete_timer_set {
            if let Some(deadline) = self.route_table.next_deletion() {
                self.is_delete_timer_set = true;
                self.schedule(deadline, TimerEvent::RouteDeletion);
            }
        }
    }
}
