use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::debug;
use tracing::info;

use crate::DEFAULT_ATTEMPTS_PER_HOP;
use crate::DEFAULT_IDENTIFIER;
use crate::DEFAULT_MAX_HOPS;
use crate::DEFAULT_TIMEOUT_SEC;
use crate::error::TraceError;
use crate::hop::ChannelFactory;
use crate::hop::ReplyMatch;
use crate::hop::icmp::RawIcmpFactory;
use crate::hop::probe_hop;
use crate::output::HopSink;
use crate::output::TextOutput;
use crate::utils::dns_reverse;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceConfig {
    pub max_hops: u8,
    pub timeout: Duration,
    pub attempts_per_hop: u8,
    /// ICMP identifier stamped on every probe of the session.
    pub identifier: u16,
    pub reply_match: ReplyMatch,
    /// Reverse resolve responder addresses.
    pub resolve_names: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            max_hops: DEFAULT_MAX_HOPS,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SEC),
            attempts_per_hop: DEFAULT_ATTEMPTS_PER_HOP,
            identifier: DEFAULT_IDENTIFIER,
            reply_match: ReplyMatch::default(),
            resolve_names: false,
        }
    }
}

impl TraceConfig {
    pub fn validate(&self) -> Result<(), TraceError> {
        if self.max_hops == 0 {
            return Err(TraceError::InvalidConfig {
                msg: "max hops must be at least 1".to_string(),
            });
        }
        if self.attempts_per_hop == 0 {
            return Err(TraceError::InvalidConfig {
                msg: "attempts per hop must be at least 1".to_string(),
            });
        }
        if self.timeout.is_zero() {
            return Err(TraceError::InvalidConfig {
                msg: "timeout must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// State for one trace invocation.
///
/// Sequence numbers are allocated from a single counter for the whole
/// session, so every probe sent to the destination carries a distinct
/// sequence (until it wraps at 65535).
#[derive(Debug, Clone)]
pub struct TraceSession {
    pub destination: Ipv4Addr,
    pub config: TraceConfig,
    sequence: u16,
    reverse_lookup: fn(IpAddr) -> Option<String>,
}

impl TraceSession {
    pub fn new(destination: Ipv4Addr, config: TraceConfig) -> TraceSession {
        TraceSession {
            destination,
            config,
            sequence: 0,
            reverse_lookup: dns_reverse,
        }
    }
    /// Replace the name lookup used when `resolve_names` is set.
    pub fn with_reverse_lookup(mut self, lookup: fn(IpAddr) -> Option<String>) -> TraceSession {
        self.reverse_lookup = lookup;
        self
    }
    pub fn identifier(&self) -> u16 {
        self.config.identifier
    }
    pub fn next_sequence(&mut self) -> u16 {
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        seq
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TraceStatus {
    Reached { hop: u8 },
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceOutcome {
    pub destination: Ipv4Addr,
    pub hops_probed: u8,
    pub status: TraceStatus,
}

impl fmt::Display for TraceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.status {
            TraceStatus::Reached { hop } => {
                write!(f, "{} reached in {} hops", self.destination, hop)
            }
            TraceStatus::Exhausted => write!(
                f,
                "{} not reached after {} hops",
                self.destination, self.hops_probed
            ),
        }
    }
}

/// Walk the path to `session.destination` one TTL at a time.
///
/// Each hop is probed exactly once and handed to `sink`. The trace stops at
/// the first hop whose responder is the destination, or after `max_hops`.
pub fn run_trace<F, S>(
    factory: &mut F,
    session: &mut TraceSession,
    sink: &mut S,
) -> Result<TraceOutcome, TraceError>
where
    F: ChannelFactory,
    S: HopSink,
{
    session.config.validate()?;
    let destination = session.destination;
    let max_hops = session.config.max_hops;
    info!(
        "trace {} max hops {} timeout {:?} attempts {}",
        destination, max_hops, session.config.timeout, session.config.attempts_per_hop
    );
    sink.begin(session)?;

    let mut status = TraceStatus::Exhausted;
    let mut hops_probed = 0;
    for ttl in 1..=max_hops {
        let mut hop = probe_hop(factory, session, ttl)?;
        hops_probed = ttl;
        if session.config.resolve_names {
            if let Some(addr) = hop.responder {
                hop.hostname = (session.reverse_lookup)(addr.into());
            }
        }
        let reached = hop.responder == Some(destination);
        sink.hop(hop)?;
        if reached {
            debug!("destination {} reached at ttl {}", destination, ttl);
            status = TraceStatus::Reached { hop: ttl };
            break;
        }
    }

    let outcome = TraceOutcome {
        destination,
        hops_probed,
        status,
    };
    info!("{}", outcome);
    sink.finish(&outcome)?;
    Ok(outcome)
}

/// Trace to an already resolved address over raw sockets, printing to stdout.
pub fn trace(destination: IpAddr, config: TraceConfig) -> Result<TraceOutcome, TraceError> {
    let destination = match destination {
        IpAddr::V4(ipv4) => ipv4,
        IpAddr::V6(_) => return Err(TraceError::UnsupportedAddress { addr: destination }),
    };
    let mut factory = RawIcmpFactory::new();
    let mut session = TraceSession::new(destination, config);
    let mut sink = TextOutput::new(std::io::stdout());
    run_trace(&mut factory, &mut session, &mut sink)
}
