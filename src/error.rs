use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    /* CONFIG ERROR */
    #[error("invalid trace config: {msg}")]
    InvalidConfig { msg: String },

    /* RESOLVE ERROR */
    #[error("can not resolve the target [{target}]")]
    Resolution { target: String },
    #[error("the address {addr} is not supported, only ipv4 targets can be traced")]
    UnsupportedAddress { addr: IpAddr },

    /* SOCKET ERROR */
    #[error("raw socket is not permitted, run as root or grant CAP_NET_RAW: {source}")]
    Privilege {
        #[source]
        source: std::io::Error,
    },
    #[error("raw socket fault on ttl {ttl}: {source}")]
    SocketFault {
        ttl: u8,
        #[source]
        source: std::io::Error,
    },
    #[error("build packet error occurred at [{location}]")]
    BuildPacketError { location: String },

    /* OTHER ERROR */
    #[error("serde json error")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("std error")]
    IOError(#[from] std::io::Error),
}
