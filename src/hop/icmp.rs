use pnet::packet::Packet;
use pnet::packet::icmp::IcmpPacket;
use pnet::packet::icmp::IcmpTypes;
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::EchoRequestPacket;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::transport::TransportChannelType::Layer4;
use pnet::transport::TransportProtocol::Ipv4;
use pnet::transport::TransportReceiver;
use pnet::transport::TransportSender;
use pnet::transport::icmp_packet_iter;
use pnet::transport::transport_channel;
use std::io;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::time::Duration;
use std::time::Instant;
use tracing::debug;

use crate::ICMP_BUFF_SIZE;
use crate::ICMP_HEADER_SIZE;
use crate::error::TraceError;
use crate::hop::ChannelFactory;
use crate::hop::Datagram;
use crate::hop::ProbeChannel;
use crate::hop::ReplyKind;

/// pnet hands the wait to the kernel as a `timeval`; anything under a
/// microsecond truncates to zero, which means no timeout at all.
const MIN_WAIT: Duration = Duration::from_micros(1);

/// Time left before `timeout` expires, `None` once it is below [`MIN_WAIT`].
fn remaining_wait(timeout: Duration, elapsed: Duration) -> Option<Duration> {
    match timeout.checked_sub(elapsed) {
        Some(left) if left >= MIN_WAIT => Some(left),
        _ => None,
    }
}

pub fn classify(icmp: &[u8]) -> ReplyKind {
    match IcmpPacket::new(icmp) {
        Some(icmp_packet) => {
            let icmp_type = icmp_packet.get_icmp_type();
            if icmp_type == IcmpTypes::EchoReply {
                ReplyKind::EchoReply
            } else if icmp_type == IcmpTypes::TimeExceeded {
                ReplyKind::TimeExceeded
            } else if icmp_type == IcmpTypes::DestinationUnreachable {
                ReplyKind::Unreachable
            } else {
                ReplyKind::Other(icmp_type.0)
            }
        }
        None => ReplyKind::Other(icmp.first().copied().unwrap_or_default()),
    }
}

/// Check that `icmp` answers the echo request (`identifier`, `sequence`),
/// either directly as an echo reply or as an error quoting the request.
pub fn matches_probe(icmp: &[u8], identifier: u16, sequence: u16) -> bool {
    let icmp_packet = match IcmpPacket::new(icmp) {
        Some(p) => p,
        None => return false,
    };
    let icmp_type = icmp_packet.get_icmp_type();
    if icmp_type == IcmpTypes::EchoReply {
        match EchoReplyPacket::new(icmp) {
            Some(reply) => {
                reply.get_identifier() == identifier && reply.get_sequence_number() == sequence
            }
            None => false,
        }
    } else if icmp_type == IcmpTypes::TimeExceeded
        || icmp_type == IcmpTypes::DestinationUnreachable
    {
        // 4 unused bytes, then the quoted ip header and 8 bytes of our probe
        let quoted = match icmp.get(ICMP_HEADER_SIZE..) {
            Some(q) => q,
            None => return false,
        };
        let ipv4_packet = match Ipv4Packet::new(quoted) {
            Some(p) => p,
            None => return false,
        };
        if ipv4_packet.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
            return false;
        }
        let header_len = ipv4_packet.get_header_length() as usize * 4;
        match quoted.get(header_len..).and_then(EchoRequestPacket::new) {
            Some(request) => {
                request.get_icmp_type() == IcmpTypes::EchoRequest
                    && request.get_identifier() == identifier
                    && request.get_sequence_number() == sequence
            }
            None => false,
        }
    } else {
        false
    }
}

/// Opens one raw ICMPv4 socket per hop through `pnet`'s transport layer.
/// The kernel builds the ip header, we only set its TTL.
#[derive(Debug, Clone, Copy)]
pub struct RawIcmpFactory {
    buffer_size: usize,
}

impl RawIcmpFactory {
    pub fn new() -> RawIcmpFactory {
        RawIcmpFactory {
            buffer_size: ICMP_BUFF_SIZE,
        }
    }
    /// Receive buffer per channel, the largest datagram that can be read.
    pub fn with_buffer_size(buffer_size: usize) -> RawIcmpFactory {
        RawIcmpFactory { buffer_size }
    }
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl Default for RawIcmpFactory {
    fn default() -> Self {
        RawIcmpFactory::new()
    }
}

pub struct RawIcmpChannel {
    ttl: u8,
    tx: TransportSender,
    rx: TransportReceiver,
}

impl ChannelFactory for RawIcmpFactory {
    type Channel = RawIcmpChannel;
    fn open(&mut self, ttl: u8) -> Result<RawIcmpChannel, TraceError> {
        let icmp_protocol = Layer4(Ipv4(IpNextHeaderProtocols::Icmp));
        let (mut tx, rx) = match transport_channel(self.buffer_size, icmp_protocol) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                return Err(TraceError::Privilege { source: e });
            }
            Err(e) => return Err(TraceError::SocketFault { ttl, source: e }),
        };
        if let Err(e) = tx.set_ttl(ttl) {
            return Err(TraceError::SocketFault { ttl, source: e });
        }
        debug!("raw icmp channel open, ttl {}", ttl);
        Ok(RawIcmpChannel { ttl, tx, rx })
    }
}

impl ProbeChannel for RawIcmpChannel {
    fn send(&mut self, packet: &[u8], destination: Ipv4Addr) -> io::Result<()> {
        let icmp_packet = match IcmpPacket::new(packet) {
            Some(p) => p,
            None => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    "probe is shorter than an icmp header",
                ));
            }
        };
        let n = self.tx.send_to(icmp_packet, destination.into())?;
        debug!("sent {} bytes to {} with ttl {}", n, destination, self.ttl);
        Ok(())
    }
    fn recv(&mut self, timeout: Duration) -> io::Result<Option<Datagram>> {
        let start = Instant::now();
        let mut icmp_iter = icmp_packet_iter(&mut self.rx);
        loop {
            let left = match remaining_wait(timeout, start.elapsed()) {
                Some(t) => t,
                None => return Ok(None),
            };
            match icmp_iter.next_with_timeout(left)? {
                Some((icmp_packet, IpAddr::V4(source))) => {
                    return Ok(Some(Datagram {
                        source,
                        icmp: icmp_packet.packet().to_vec(),
                    }));
                }
                Some((_, addr)) => debug!("ignore datagram from {}", addr),
                None => return Ok(None),
            }
        }
    }
}

impl Drop for RawIcmpChannel {
    fn drop(&mut self) {
        debug!("raw icmp channel closed, ttl {}", self.ttl);
    }
}
