use chrono::Utc;
use pnet::packet::icmp::IcmpCode;
use pnet::packet::icmp::IcmpTypes;
use pnet::packet::icmp::echo_request::EchoRequestPacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::Packet;
use std::panic::Location;

use crate::ICMP_HEADER_SIZE;
use crate::PROBE_DATA_SIZE;
use crate::checksum::checksum;
use crate::error::TraceError;

pub const PROBE_SIZE: usize = ICMP_HEADER_SIZE + PROBE_DATA_SIZE;

/// One echo request as it goes on the wire. The payload carries the send
/// time as a big endian `f64` of seconds since the unix epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EchoRequest {
    pub identifier: u16,
    pub sequence: u16,
    pub timestamp: f64,
}

impl EchoRequest {
    pub fn new(identifier: u16, sequence: u16, timestamp: f64) -> EchoRequest {
        EchoRequest {
            identifier,
            sequence,
            timestamp,
        }
    }
    /// Stamp the request with the current wall clock.
    pub fn now(identifier: u16, sequence: u16) -> EchoRequest {
        EchoRequest::new(identifier, sequence, unix_timestamp())
    }
    #[track_caller]
    pub fn to_bytes(&self) -> Result<Vec<u8>, TraceError> {
        let mut icmp_buff = vec![0u8; PROBE_SIZE];
        {
            let mut icmp_header = match MutableEchoRequestPacket::new(&mut icmp_buff) {
                Some(p) => p,
                None => {
                    return Err(TraceError::BuildPacketError {
                        location: format!("{}", Location::caller()),
                    });
                }
            };
            icmp_header.set_icmp_type(IcmpTypes::EchoRequest);
            icmp_header.set_icmp_code(IcmpCode(0));
            icmp_header.set_checksum(0);
            icmp_header.set_identifier(self.identifier);
            icmp_header.set_sequence_number(self.sequence);
            icmp_header.set_payload(&self.timestamp.to_be_bytes());
        }
        let c = checksum(&icmp_buff);
        match MutableEchoRequestPacket::new(&mut icmp_buff) {
            Some(mut p) => p.set_checksum(c),
            None => {
                return Err(TraceError::BuildPacketError {
                    location: format!("{}", Location::caller()),
                });
            }
        }
        Ok(icmp_buff)
    }
    /// Parse a request built by [`EchoRequest::to_bytes`].
    pub fn from_bytes(buff: &[u8]) -> Option<EchoRequest> {
        if buff.len() < PROBE_SIZE {
            return None;
        }
        let packet = EchoRequestPacket::new(buff)?;
        if packet.get_icmp_type() != IcmpTypes::EchoRequest {
            return None;
        }
        let payload: [u8; PROBE_DATA_SIZE] = packet.payload().get(..PROBE_DATA_SIZE)?.try_into().ok()?;
        Some(EchoRequest {
            identifier: packet.get_identifier(),
            sequence: packet.get_sequence_number(),
            timestamp: f64::from_be_bytes(payload),
        })
    }
}

/// Seconds since the unix epoch, microsecond resolution.
pub fn unix_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Build a checksummed echo request stamped with the current time.
pub fn build_probe(identifier: u16, sequence: u16) -> Result<Vec<u8>, TraceError> {
    EchoRequest::now(identifier, sequence).to_bytes()
}

/// Same as [`build_probe`] with an explicit timestamp.
pub fn build_probe_at(
    identifier: u16,
    sequence: u16,
    timestamp: f64,
) -> Result<Vec<u8>, TraceError> {
    EchoRequest::new(identifier, sequence, timestamp).to_bytes()
}
