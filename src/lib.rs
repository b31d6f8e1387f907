#![doc = include_str!("lib.md")]

pub mod checksum;
pub mod error;
pub mod hop;
pub mod output;
pub mod probe;
pub mod trace;
pub mod utils;

const ICMP_BUFF_SIZE: usize = 4096;
const ICMP_HEADER_SIZE: usize = 8;
/// Payload is the send timestamp, an 8 byte float.
const PROBE_DATA_SIZE: usize = 8;

pub const DEFAULT_MAX_HOPS: u8 = 30;
pub const DEFAULT_TIMEOUT_SEC: u64 = 1;
pub const DEFAULT_ATTEMPTS_PER_HOP: u8 = 3;
pub const DEFAULT_IDENTIFIER: u16 = 54321;

pub use checksum::checksum;
pub use error::TraceError;
pub use hop::ChannelFactory;
pub use hop::Datagram;
pub use hop::HopResult;
pub use hop::ProbeAttempt;
pub use hop::ProbeChannel;
pub use hop::ProbeOutcome;
pub use hop::ReplyKind;
pub use hop::ReplyMatch;
pub use hop::icmp::RawIcmpFactory;
pub use hop::probe_hop;
pub use output::HopSink;
pub use output::JsonOutput;
pub use output::TableOutput;
pub use output::Tee;
pub use output::TextOutput;
pub use output::format_hop_line;
pub use probe::EchoRequest;
pub use probe::build_probe;
pub use probe::build_probe_at;
pub use trace::TraceConfig;
pub use trace::TraceOutcome;
pub use trace::TraceSession;
pub use trace::TraceStatus;
pub use trace::run_trace;
pub use trace::trace;
pub use utils::dns_reverse;
pub use utils::resolve_target;
