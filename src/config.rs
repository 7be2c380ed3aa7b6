//! Engine configuration. Values missing from the input fall back to the
//! protocol defaults; derived timings are computed once at build time.

use chrono::Duration;

use crate::{AodvError, AodvErrorKind};

// Protocol defaults (draft-ietf-manet-aodv-08 section 12 names)
pub const DEFAULT_NET_DIAMETER: u32 = 35;
pub const DEFAULT_NODE_TRAVERSAL_TIME: i64 = 40; //ms
pub const DEFAULT_ACTIVE_ROUTE_TIMEOUT: i64 = 3_000; //ms
pub const DEFAULT_ALLOWED_HELLO_LOSS: u32 = 2;
pub const DEFAULT_HELLO_INTERVAL: i64 = 1_000; //ms
pub const DEFAULT_RREQ_RETRIES: u32 = 2;
pub const DEFAULT_ROUTE_DELETE_CONST: u32 = 5;
pub const DEFAULT_TTL_START: u32 = 1;
pub const DEFAULT_TTL_INCREMENT: u32 = 2;
pub const DEFAULT_TTL_THRESHOLD: u32 = 7;
pub const DEFAULT_BUFFER_MAX_PACKETS: usize = 100;
// 0 means the packet cap governs instead
pub const DEFAULT_BUFFER_MAX_BYTES: usize = 0;
pub const LOCAL_ADD_TTL: u32 = 2;
/// Hop count sentinel for a route with no usable distance.
pub const INFINITY: i32 = -1;

/// User-facing configuration. Every field is optional; `build` resolves
/// the gaps against the defaults above.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub net_diameter: Option<u32>,
    pub node_traversal_time: Option<i64>,
    pub active_route_timeout: Option<i64>,
    pub my_route_timeout: Option<i64>,
    pub allowed_hello_loss: Option<u32>,
    pub hello_interval: Option<i64>,
    pub rreq_retries: Option<u32>,
    pub route_deletion_constant: Option<u32>,
    pub ttl_start: Option<u32>,
    pub ttl_increment: Option<u32>,
    pub ttl_threshold: Option<u32>,
    pub buffer_max_packets: Option<usize>,
    pub buffer_max_bytes: Option<usize>,
    pub process_hello: Option<bool>,
    pub local_repair: Option<bool>,
    pub process_rrep_ack: Option<bool>,
    pub search_better_route: Option<bool>,
    pub bidirectional_connection: Option<bool>,
    pub dest_only: Option<bool>,
}

impl Config {
    pub fn from_toml(input: &str) -> Result<Config, AodvError> {
        toml::from_str(input).map_err(|e| AodvError {
            cause: Some(Box::new(e)),
            kind: AodvErrorKind::Configuration("failed to parse configuration".into()),
        })
    }

    /// Resolve into the full parameter set, validating core timings.
    pub fn build(&self) -> Result<Params, AodvError> {
        let net_diameter = self.net_diameter.unwrap_or(DEFAULT_NET_DIAMETER);
        let node_traversal_time = self
            .node_traversal_time
            .unwrap_or(DEFAULT_NODE_TRAVERSAL_TIME);
        let active_route_timeout = self
            .active_route_timeout
            .unwrap_or(DEFAULT_ACTIVE_ROUTE_TIMEOUT);
        let my_route_timeout = self.my_route_timeout.unwrap_or(2 * active_route_timeout);
        let allowed_hello_loss = self.allowed_hello_loss.unwrap_or(DEFAULT_ALLOWED_HELLO_LOSS);
        let hello_interval = self.hello_interval.unwrap_or(DEFAULT_HELLO_INTERVAL);
        let rreq_retries = self.rreq_retries.unwrap_or(DEFAULT_RREQ_RETRIES);
        let route_deletion_constant = self
            .route_deletion_constant
            .unwrap_or(DEFAULT_ROUTE_DELETE_CONST);
        let process_hello = self.process_hello.unwrap_or(false);

        if net_diameter == 0 {
            return Err(
                AodvErrorKind::Configuration("net_diameter must be positive".into()).into(),
            );
        }
        for (name, value) in &[
            ("node_traversal_time", node_traversal_time),
            ("active_route_timeout", active_route_timeout),
            ("my_route_timeout", my_route_timeout),
            ("hello_interval", hello_interval),
        ] {
            if *value <= 0 {
                return Err(AodvErrorKind::Configuration(format!(
                    "{} must be positive",
                    name
                ))
                .into());
            }
        }

        // Deviation from the RFC carried over from the reference behavior:
        // the traversal estimate uses a 3/2 factor, not 2.
        let net_traversal_time = 3 * node_traversal_time * i64::from(net_diameter) / 2;
        let delete_period = if process_hello {
            i64::from(route_deletion_constant)
                * active_route_timeout
                    .max(i64::from(allowed_hello_loss) * hello_interval)
        } else {
            i64::from(route_deletion_constant) * active_route_timeout
        };

        Ok(Params {
            net_diameter,
            node_traversal_time: Duration::milliseconds(node_traversal_time),
            net_traversal_time: Duration::milliseconds(net_traversal_time),
            active_route_timeout: Duration::milliseconds(active_route_timeout),
            my_route_timeout: Duration::milliseconds(my_route_timeout),
            rev_route_life: Duration::milliseconds(net_traversal_time),
            flood_record_time: Duration::milliseconds(2 * net_traversal_time),
            blacklist_timeout: Duration::milliseconds(
                i64::from(rreq_retries) * net_traversal_time,
            ),
            next_hop_wait: Duration::milliseconds(node_traversal_time + 10),
            delete_period: Duration::milliseconds(delete_period),
            hello_interval: Duration::milliseconds(hello_interval),
            allowed_hello_loss,
            rreq_retries,
            ttl_start: self.ttl_start.unwrap_or(DEFAULT_TTL_START),
            ttl_increment: self.ttl_increment.unwrap_or(DEFAULT_TTL_INCREMENT),
            ttl_threshold: self.ttl_threshold.unwrap_or(DEFAULT_TTL_THRESHOLD),
            max_repair_ttl: (f64::from(net_diameter) * 0.3) as u32,
            buffer_max_packets: self
                .buffer_max_packets
                .unwrap_or(DEFAULT_BUFFER_MAX_PACKETS),
            buffer_max_bytes: self.buffer_max_bytes.unwrap_or(DEFAULT_BUFFER_MAX_BYTES),
            process_hello,
            local_repair: self.local_repair.unwrap_or(false),
            process_rrep_ack: self.process_rrep_ack.unwrap_or(false),
            search_better_route: self.search_better_route.unwrap_or(false),
            bidirectional_connection: self.bidirectional_connection.unwrap_or(false),
            dest_only: self.dest_only.unwrap_or(false),
        })
    }
}

/// Fully-resolved operating parameters.
#[derive(Debug, Clone)]
pub struct Params {
    pub net_diameter: u32,
    pub node_traversal_time: Duration,
    pub net_traversal_time: Duration,
    pub active_route_timeout: Duration,
    pub my_route_timeout: Duration,
    /// Lifetime granted to a reverse route before data uses it
    pub rev_route_life: Duration,
    pub flood_record_time: Duration,
    pub blacklist_timeout: Duration,
    pub next_hop_wait: Duration,
    pub delete_period: Duration,
    pub hello_interval: Duration,
    pub allowed_hello_loss: u32,
    pub rreq_retries: u32,
    pub ttl_start: u32,
    pub ttl_increment: u32,
    pub ttl_threshold: u32,
    pub max_repair_ttl: u32,
    pub buffer_max_packets: usize,
    pub buffer_max_bytes: usize,
    pub process_hello: bool,
    pub local_repair: bool,
    pub process_rrep_ack: bool,
    pub search_better_route: bool,
    pub bidirectional_connection: bool,
    pub dest_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_resolve() {
        let p = Config::default().build().unwrap();
        assert_eq!(p.net_diameter, 35);
        assert_eq!(p.node_traversal_time, Duration::milliseconds(40));
        assert_eq!(p.active_route_timeout, Duration::milliseconds(3_000));
        assert_eq!(p.my_route_timeout, Duration::milliseconds(6_000));
        // 3 * 40 * 35 / 2
        assert_eq!(p.net_traversal_time, Duration::milliseconds(2_100));
        assert_eq!(p.flood_record_time, Duration::milliseconds(4_200));
        assert_eq!(p.blacklist_timeout, Duration::milliseconds(4_200));
        assert_eq!(p.delete_period, Duration::milliseconds(15_000));
        assert_eq!(p.max_repair_ttl, 10);
        assert_eq!(p.buffer_max_packets, 100);
        assert_eq!(p.buffer_max_bytes, 0);
        assert!(!p.process_hello);
        assert!(!p.local_repair);
    }

    #[test]
    fn toml_overrides() {
        let cfg = Config::from_toml(
            r#"
            net_diameter = 10
            active_route_timeout = 5000
            process_hello = true
            "#,
        )
        .unwrap();
        let p = cfg.build().unwrap();
        assert_eq!(p.net_diameter, 10);
        assert_eq!(p.active_route_timeout, Duration::milliseconds(5_000));
        // hello processing folds hello loss into the delete period
        assert_eq!(p.delete_period, Duration::milliseconds(25_000));
        assert!(p.process_hello);
    }

    #[test]
    fn rejects_bad_timings() {
        let cfg = Config {
            node_traversal_time: Some(0),
            ..Config::default()
        };
        assert!(cfg.build().is_err());
    }
}
