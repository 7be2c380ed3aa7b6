//! Multi-node scenarios driven over an in-memory network. Control
//! packets travel as wire bytes, so these also exercise the codec end
//! to end.

extern crate aodv_engine;
extern crate chrono;
#[macro_use]
extern crate pretty_assertions;

use chrono::{DateTime, Duration, Utc};

use aodv_engine::address::{Address, AddressFamily};
use aodv_engine::buffer::DataPacket;
use aodv_engine::config::Config;
use aodv_engine::engine::{AodvEngine, FailedTransmission};
use aodv_engine::logging::create_discard_logger;
use aodv_engine::messages::AodvMessage;
use aodv_engine::transport::Transport;
use aodv_engine::AodvError;

fn addr(s: &str) -> Address {
    s.parse().unwrap()
}

#[derive(Debug)]
enum Frame {
    Broadcast { bytes: Vec<u8>, ttl: u32 },
    Unicast { bytes: Vec<u8>, to: Address, ttl: u32 },
    Data { packet: DataPacket, to: Address },
}

/// Transport that parks outgoing frames for the harness to move.
struct QueueTransport {
    local: Address,
    outbox: Vec<Frame>,
    delivered: Vec<DataPacket>,
}

impl QueueTransport {
    fn new(local: Address) -> QueueTransport {
        QueueTransport {
            local,
            outbox: Vec::new(),
            delivered: Vec::new(),
        }
    }
}

impl Transport for QueueTransport {
    fn interface_count(&self) -> usize {
        1
    }

    fn local_address(&self, _interface: usize) -> Address {
        self.local
    }

    fn is_local_address(&self, address: &Address) -> bool {
        self.local == *address
    }

    fn unicast_control(
        &mut self,
        msg: &AodvMessage,
        next_hop: Address,
        _interface: usize,
        ttl: u32,
        _delay: Duration,
    ) -> Result<(), AodvError> {
        self.outbox.push(Frame::Unicast {
            bytes: msg.to_bytes(),
            to: next_hop,
            ttl,
        });
        Ok(())
    }

    fn broadcast_control(
        &mut self,
        msg: &AodvMessage,
        _interface: usize,
        ttl: u32,
        _delay: Duration,
    ) -> Result<(), AodvError> {
        self.outbox.push(Frame::Broadcast {
            bytes: msg.to_bytes(),
            ttl,
        });
        Ok(())
    }

    fn send_data(
        &mut self,
        packet: DataPacket,
        next_hop: Address,
        _interface: usize,
    ) -> Result<(), AodvError> {
        self.outbox.push(Frame::Data {
            packet,
            to: next_hop,
        });
        Ok(())
    }

    fn deliver(&mut self, packet: DataPacket) {
        self.delivered.push(packet);
    }
}

/// A handful of nodes joined by point-to-point links.
struct TestNet {
    addrs: Vec<Address>,
    nodes: Vec<AodvEngine<QueueTransport>>,
    links: Vec<(usize, usize)>,
    now: DateTime<Utc>,
}

impl TestNet {
    fn new(addrs: &[&str], links: &[(usize, usize)], config: Config) -> TestNet {
        let now = Utc::now();
        let addrs: Vec<Address> = addrs.iter().map(|a| addr(a)).collect();
        let nodes = addrs
            .iter()
            .map(|&local| {
                AodvEngine::new(
                    config.build().unwrap(),
                    QueueTransport::new(local),
                    AddressFamily::V4,
                    create_discard_logger(),
                    now,
                )
            })
            .collect();
        TestNet {
            addrs,
            nodes,
            links: links.to_vec(),
            now,
        }
    }

    fn connected(&self, a: usize, b: usize) -> bool {
        self.links.contains(&(a, b)) || self.links.contains(&(b, a))
    }

    fn cut_link(&mut self, a: usize, b: usize) {
        self.links.retain(|&l| l != (a, b) && l != (b, a));
    }

    fn index_of(&self, address: &Address) -> Option<usize> {
        self.addrs.iter().position(|a| a == address)
    }

    fn send(&mut self, from: usize, to: usize, payload: Vec<u8>) {
        let packet = DataPacket {
            source: self.addrs[from],
            destination: self.addrs[to],
            previous_hop: self.addrs[from],
            payload,
        };
        let now = self.now;
        self.nodes[from].route_data(packet, now).unwrap();
        self.run();
    }

    /// Move every parked frame once. Returns whether anything moved.
    fn step(&mut self) -> bool {
        let mut moved = false;
        for from in 0..self.nodes.len() {
            let frames: Vec<Frame> =
                self.nodes[from].transport_mut().outbox.drain(..).collect();
            for frame in frames {
                moved = true;
                self.deliver(from, frame);
            }
        }
        moved
    }

    /// Move frames until the network goes quiet.
    fn run(&mut self) {
        while self.step() {}
    }

    /// Advance the clock and let every node run its due timers.
    fn advance(&mut self, ms: i64) {
        self.now = self.now + Duration::milliseconds(ms);
        let now = self.now;
        for node in &mut self.nodes {
            node.handle_timers(now).unwrap();
        }
        self.run();
    }

    fn deliver(&mut self, from: usize, frame: Frame) {
        let sender = self.addrs[from];
        let now = self.now;
        match frame {
            Frame::Broadcast { bytes, ttl } => {
                for to in 0..self.nodes.len() {
                    if to != from && self.connected(from, to) {
                        self.nodes[to]
                            .handle_control(&bytes, sender, 0, ttl, now)
                            .unwrap();
                    }
                }
            }
            Frame::Unicast { bytes, to, ttl } => {
                let target = self.index_of(&to).unwrap();
                if self.connected(from, target) {
                    self.nodes[target]
                        .handle_control(&bytes, sender, 0, ttl, now)
                        .unwrap();
                } else {
                    let msg = AodvMessage::from_bytes(&bytes, AddressFamily::V4).unwrap();
                    self.nodes[from]
                        .link_failure(to, FailedTransmission::Control(msg), 0, now)
                        .unwrap();
                }
            }
            Frame::Data { mut packet, to } => {
                let target = self.index_of(&to).unwrap();
                if self.connected(from, target) {
                    packet.previous_hop = sender;
                    self.nodes[target].route_data(packet, now).unwrap();
                } else {
                    self.nodes[from]
                        .link_failure(to, FailedTransmission::Data(packet), 0, now)
                        .unwrap();
                }
            }
        }
    }
}

#[test]
fn three_node_chain_discovers_and_delivers() {
    let mut net = TestNet::new(
        &["10.0.0.1", "10.0.0.2", "10.0.0.3"],
        &[(0, 1), (1, 2)],
        Config::default(),
    );
    net.send(0, 2, vec![0x42; 16]);

    // The first ring only reaches the direct neighbour, which is not
    // the destination.
    assert!(net.nodes[2].transport().delivered.is_empty());
    assert_eq!(net.nodes[1].stats().requests_ttl_expired, 1);

    // The retry widens the ring past the middle node.
    net.advance(100);
    assert_eq!(net.nodes[2].transport().delivered.len(), 1);
    assert_eq!(net.nodes[2].transport().delivered[0].payload, vec![0x42; 16]);

    assert_eq!(net.nodes[0].stats().requests_resent, 1);
    assert_eq!(net.nodes[1].stats().requests_relayed, 1);
    assert_eq!(net.nodes[2].stats().replies_initiated_as_dest, 1);
    assert_eq!(net.nodes[1].stats().replies_forwarded, 1);
    assert_eq!(net.nodes[1].stats().data_forwarded, 1);

    // Routes are in place now, so more data flows without discovery.
    net.send(0, 2, vec![0x43; 4]);
    assert_eq!(net.nodes[2].transport().delivered.len(), 2);
    assert_eq!(net.nodes[0].stats().requests_initiated, 1);

    // And the destination can answer along the reverse route.
    net.send(2, 0, vec![0x44; 4]);
    assert_eq!(net.nodes[0].transport().delivered.len(), 1);
    assert_eq!(net.nodes[2].stats().requests_initiated, 0);
}

#[test]
fn broken_link_propagates_a_route_error() {
    let mut net = TestNet::new(
        &["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"],
        &[(0, 1), (1, 2), (2, 3)],
        Config::default(),
    );
    net.send(0, 3, vec![1]);
    net.advance(200);
    assert_eq!(net.nodes[3].transport().delivered.len(), 1);

    // The far link dies; the next packet fails at the node before it.
    net.cut_link(2, 3);
    net.send(0, 3, vec![2]);

    assert_eq!(net.nodes[2].stats().broken_links, 1);
    assert_eq!(net.nodes[2].stats().rerr_initiated, 1);
    // Each upstream node passed the error on to its own precursor.
    assert_eq!(net.nodes[1].stats().rerr_received, 1);
    assert_eq!(net.nodes[1].stats().rerr_forwarded, 1);
    assert_eq!(net.nodes[0].stats().rerr_received, 1);
    assert_eq!(net.nodes[0].stats().rerr_forwarded, 0);

    // The source lost its route and must search again.
    net.send(0, 3, vec![3]);
    assert_eq!(net.nodes[0].stats().requests_initiated, 2);
    assert_eq!(net.nodes[3].transport().delivered.len(), 1);
}

#[test]
fn rejoined_network_recovers_after_an_error() {
    let mut net = TestNet::new(
        &["10.0.0.1", "10.0.0.2", "10.0.0.3"],
        &[(0, 1), (1, 2)],
        Config::default(),
    );
    net.send(0, 2, vec![1]);
    net.advance(100);
    assert_eq!(net.nodes[2].transport().delivered.len(), 1);

    net.cut_link(1, 2);
    net.send(0, 2, vec![2]);
    assert_eq!(net.nodes[0].stats().rerr_received, 1);

    // Link comes back; a new search succeeds. The fresh request needs
    // a wider ring again, so drive the retry timer.
    net.links.push((1, 2));
    net.send(0, 2, vec![3]);
    net.advance(100);
    net.advance(300);
    assert_eq!(net.nodes[2].transport().delivered.len(), 2);
    assert_eq!(net.nodes[2].transport().delivered[1].payload, vec![3]);
}

#[test]
fn intermediate_node_answers_from_its_own_table() {
    // A square: 0-1-2 in a chain, 3 hanging off 1. Once 1 knows the
    // route to 2, a search from 3 never has to reach 2 itself.
    let mut net = TestNet::new(
        &["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"],
        &[(0, 1), (1, 2), (1, 3)],
        Config::default(),
    );
    net.send(0, 2, vec![1]);
    net.advance(100);
    assert_eq!(net.nodes[2].transport().delivered.len(), 1);

    net.send(3, 2, vec![2]);
    assert_eq!(net.nodes[1].stats().replies_initiated_as_intermediate, 1);
    assert_eq!(net.nodes[2].stats().requests_received, 1);
    assert_eq!(net.nodes[2].transport().delivered.len(), 2);
}

#[test]
fn hello_silence_tears_down_the_neighbour_route() {
    let mut config = Config::default();
    config.process_hello = Some(true);
    let mut net = TestNet::new(&["10.0.0.1", "10.0.0.2"], &[(0, 1)], config);

    // Let a few hello rounds install the neighbour routes.
    for _ in 0..3 {
        net.advance(1_100);
    }
    assert!(net.nodes[0].stats().hellos_received >= 2);
    net.send(0, 1, vec![9]);
    assert_eq!(net.nodes[1].transport().delivered.len(), 1);
    assert_eq!(net.nodes[0].stats().requests_initiated, 0);

    // Silence the peer and wait out the neighbour timeout.
    net.cut_link(0, 1);
    for _ in 0..6 {
        net.advance(1_100);
    }
    assert!(net.nodes[0].stats().broken_links >= 1);

    // The route is gone, so new data needs a fresh search.
    let packet = DataPacket {
        source: addr("10.0.0.1"),
        destination: addr("10.0.0.2"),
        previous_hop: addr("10.0.0.1"),
        payload: vec![10],
    };
    let now = net.now;
    net.nodes[0].route_data(packet, now).unwrap();
    assert_eq!(net.nodes[0].stats().requests_initiated, 1);
}
