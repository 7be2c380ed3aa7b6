//*****************
//External crates
//*****************
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate slog;
#[macro_use]
extern crate bitflags;

//*****************
//Modules declaration
//*****************
pub mod address;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod logging;
pub mod messages;
pub mod route_table;
pub mod stats;
pub mod tables;
pub mod transport;

//*****************
//Constants
//*****************
pub const ONE_SECOND_NS: u64 = 1_000_000_000;
pub const ONE_MILLISECOND_NS: u64 = 1_000_000;

//*****************
//Errors
//*****************
use std::error::Error;
use std::fmt;

/// Error struct for this crate
#[derive(Debug)]
pub struct AodvError {
    pub cause: Option<Box<dyn Error>>,
    pub kind: AodvErrorKind,
}

/// Types of errors produced in this crate
#[derive(Debug)]
pub enum AodvErrorKind {
    /// Failures in configuration of the engine
    Configuration(String),
    /// Failures [de]serializing control packets
    Serialization(String),
    /// Failures handing packets to the transport
    Networking(String),
    /// Route-table consistency failures
    RouteTable(String),
    /// A packet was dropped; the payload names the reason
    PacketDropped(DropReason),
}

/// Reasons the engine discards a packet. Each one maps to a counter
/// in [stats::AodvStats](stats/struct.AodvStats.html).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// RREQ with an (originator, flooding id) pair already seen
    Duplicate,
    /// Hop count or TTL past the network diameter
    TtlExceeded,
    /// RREQ from a sender in the blacklist
    BlacklistedSender,
    /// RREP carrying a zero lifetime
    StaleControlMessage,
    /// No route and no discovery pending
    NoRoute,
    /// Message buffer at capacity; the incoming packet is dropped
    BufferOverflow,
    /// Transmission to the next hop failed
    LinkFailure,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DropReason::Duplicate => write!(f, "duplicate flood"),
            DropReason::TtlExceeded => write!(f, "ttl exceeded"),
            DropReason::BlacklistedSender => write!(f, "sender blacklisted"),
            DropReason::StaleControlMessage => write!(f, "stale control message"),
            DropReason::NoRoute => write!(f, "no route"),
            DropReason::BufferOverflow => write!(f, "buffer overflow"),
            DropReason::LinkFailure => write!(f, "link failure"),
        }
    }
}

impl Error for AodvError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self.cause {
            Some(ref cause) => Some(&**cause),
            None => None,
        }
    }
}

impl fmt::Display for AodvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl fmt::Display for AodvErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AodvErrorKind::Configuration(msg) => write!(f, "{}", msg),
            AodvErrorKind::Serialization(msg) => write!(f, "{}", msg),
            AodvErrorKind::Networking(msg) => write!(f, "{}", msg),
            AodvErrorKind::RouteTable(msg) => write!(f, "{}", msg),
            AodvErrorKind::PacketDropped(reason) => write!(f, "packet dropped: {}", reason),
        }
    }
}

impl From<AodvErrorKind> for AodvError {
    fn from(kind: AodvErrorKind) -> AodvError {
        AodvError { cause: None, kind }
    }
}

impl From<std::io::Error> for AodvError {
    fn from(error: std::io::Error) -> AodvError {
        AodvError {
            kind: AodvErrorKind::Configuration(format!("{}", &error)),
            cause: Some(Box::new(error)),
        }
    }
}

/// Sequence-number freshness per the signed 32-bit difference rule.
/// `a` is fresher than `b` when the wrapped difference is positive,
/// which keeps comparisons correct across wraparound.
pub fn fresher(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}
