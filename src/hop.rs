use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::io;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::time::Duration;
use std::time::Instant;
use tracing::debug;
use tracing::warn;

use crate::error::TraceError;
use crate::probe::EchoRequest;
use crate::trace::TraceSession;

pub mod icmp;

/// `EBADF` from `<errno.h>`, the same value on Linux, macOS and the BSDs.
#[cfg(unix)]
const EBADF: i32 = 9;

/// How an inbound datagram is tied to the probe in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMatch {
    /// Any ICMP datagram that shows up during the wait is taken as the reply.
    /// Stray ICMP traffic or a concurrent trace can be misattributed.
    #[default]
    FirstDatagram,
    /// Only echo replies or ICMP errors that quote our identifier and sequence.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    EchoReply,
    TimeExceeded,
    Unreachable,
    Other(u8),
}

impl fmt::Display for ReplyKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReplyKind::EchoReply => write!(f, "echo-reply"),
            ReplyKind::TimeExceeded => write!(f, "time-exceeded"),
            ReplyKind::Unreachable => write!(f, "unreachable"),
            ReplyKind::Other(t) => write!(f, "icmp-type-{}", t),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Reply {
        rtt_ms: f64,
        responder: Ipv4Addr,
        kind: ReplyKind,
    },
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeAttempt {
    pub hop: u8,
    pub sequence: u16,
    /// Seconds since the unix epoch, the same value carried in the probe payload.
    pub sent_at: f64,
    pub outcome: ProbeOutcome,
}

impl ProbeAttempt {
    pub fn rtt_ms(&self) -> Option<f64> {
        match self.outcome {
            ProbeOutcome::Reply { rtt_ms, .. } => Some(rtt_ms),
            ProbeOutcome::Timeout => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopResult {
    pub hop: u8,
    pub attempts: Vec<ProbeAttempt>,
    /// Source of the last reply seen at this hop.
    pub responder: Option<Ipv4Addr>,
    pub hostname: Option<String>,
}

impl HopResult {
    pub fn all_timed_out(&self) -> bool {
        self.attempts
            .iter()
            .all(|a| a.outcome == ProbeOutcome::Timeout)
    }
    pub fn replies(&self) -> usize {
        self.attempts.iter().filter(|a| a.rtt_ms().is_some()).count()
    }
    /// Fraction of attempts that timed out, 0.0 to 1.0.
    pub fn loss(&self) -> f64 {
        if self.attempts.is_empty() {
            return 0.0;
        }
        let lost = self.attempts.len() - self.replies();
        lost as f64 / self.attempts.len() as f64
    }
}

/// A datagram read off the receive side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub source: Ipv4Addr,
    /// The ICMP message, ip header already stripped.
    pub icmp: Vec<u8>,
}

/// Send and receive side used for the probes of a single hop.
/// Dropping the channel closes the underlying sockets.
pub trait ProbeChannel {
    fn send(&mut self, packet: &[u8], destination: Ipv4Addr) -> io::Result<()>;
    /// Block for at most `timeout`, `Ok(None)` when nothing arrived.
    fn recv(&mut self, timeout: Duration) -> io::Result<Option<Datagram>>;
}

/// Opens a fresh channel with the outbound TTL already applied.
pub trait ChannelFactory {
    type Channel: ProbeChannel;
    fn open(&mut self, ttl: u8) -> Result<Self::Channel, TraceError>;
}

#[cfg(unix)]
fn is_bad_descriptor(e: &io::Error) -> bool {
    e.raw_os_error() == Some(EBADF)
}

#[cfg(not(unix))]
fn is_bad_descriptor(_e: &io::Error) -> bool {
    false
}

fn send_error_is_fatal(e: &io::Error) -> bool {
    e.kind() == ErrorKind::PermissionDenied || is_bad_descriptor(e)
}

fn wait_reply<C: ProbeChannel>(
    channel: &mut C,
    session: &TraceSession,
    ttl: u8,
    sequence: u16,
    start: Instant,
) -> Result<ProbeOutcome, TraceError> {
    let timeout = session.config.timeout;
    loop {
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Ok(ProbeOutcome::Timeout);
        }
        let datagram = match channel.recv(timeout - elapsed) {
            Ok(Some(d)) => d,
            Ok(None) => return Ok(ProbeOutcome::Timeout),
            Err(e) => match e.kind() {
                ErrorKind::WouldBlock | ErrorKind::TimedOut => return Ok(ProbeOutcome::Timeout),
                ErrorKind::Interrupted => continue,
                _ => return Err(TraceError::SocketFault { ttl, source: e }),
            },
        };
        let rtt = start.elapsed();
        if session.config.reply_match == ReplyMatch::Strict
            && !icmp::matches_probe(&datagram.icmp, session.identifier(), sequence)
        {
            debug!(
                "ttl {} seq {}: skip unrelated icmp from {}",
                ttl, sequence, datagram.source
            );
            continue;
        }
        return Ok(ProbeOutcome::Reply {
            rtt_ms: rtt.as_secs_f64() * 1000.0,
            responder: datagram.source,
            kind: icmp::classify(&datagram.icmp),
        });
    }
}

/// Probe one hop: open a channel at `ttl`, send the configured number of
/// echo requests one after another and wait for each reply in turn.
/// The channel is dropped on every return path.
pub fn probe_hop<F: ChannelFactory>(
    factory: &mut F,
    session: &mut TraceSession,
    ttl: u8,
) -> Result<HopResult, TraceError> {
    let mut channel = factory.open(ttl)?;
    let destination = session.destination;
    let attempts_per_hop = session.config.attempts_per_hop;

    let mut attempts = Vec::with_capacity(attempts_per_hop as usize);
    let mut responder = None;
    for _ in 0..attempts_per_hop {
        let sequence = session.next_sequence();
        let request = EchoRequest::now(session.identifier(), sequence);
        let packet = request.to_bytes()?;

        let start = Instant::now();
        let outcome = match channel.send(&packet, destination) {
            Ok(_) => wait_reply(&mut channel, session, ttl, sequence, start)?,
            Err(e) if send_error_is_fatal(&e) => {
                return Err(match e.kind() {
                    ErrorKind::PermissionDenied => TraceError::Privilege { source: e },
                    _ => TraceError::SocketFault { ttl, source: e },
                });
            }
            Err(e) => {
                warn!("ttl {} seq {}: send to {} failed: {}", ttl, sequence, destination, e);
                ProbeOutcome::Timeout
            }
        };
        match outcome {
            ProbeOutcome::Reply {
                rtt_ms,
                responder: addr,
                kind,
            } => {
                debug!("ttl {} seq {}: {} from {} in {:.2} ms", ttl, sequence, kind, addr, rtt_ms);
                responder = Some(addr);
            }
            ProbeOutcome::Timeout => debug!("ttl {} seq {}: timeout", ttl, sequence),
        }
        attempts.push(ProbeAttempt {
            hop: ttl,
            sequence,
            sent_at: request.timestamp,
            outcome,
        });
    }

    Ok(HopResult {
        hop: ttl,
        attempts,
        responder,
        hostname: None,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::probe::EchoRequest;
    use crate::trace::TraceConfig;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Event {
        Open(u8),
        Send(u8, u16),
        Close(u8),
    }

    /// What the scripted network does with one probe.
    #[derive(Debug, Clone)]
    pub(crate) enum Script {
        Reply(Datagram),
        /// Several datagrams land during the same wait.
        Burst(Vec<Datagram>),
        Silent,
        SendError(ErrorKind),
        RecvError(ErrorKind),
    }

    #[derive(Default)]
    pub(crate) struct MockNet {
        pub events: Vec<Event>,
        pub scripts: HashMap<u8, VecDeque<Script>>,
        /// Fallback per ttl once its queued scripts run out.
        pub responders: HashMap<u8, Ipv4Addr>,
        pub refuse_open: bool,
    }

    pub(crate) struct MockFactory {
        pub net: Rc<RefCell<MockNet>>,
    }

    pub(crate) struct MockChannel {
        ttl: u8,
        net: Rc<RefCell<MockNet>>,
        inbox: VecDeque<Datagram>,
        recv_error: Option<ErrorKind>,
    }

    pub(crate) fn time_exceeded_from(source: Ipv4Addr) -> Datagram {
        Datagram {
            source,
            icmp: vec![11, 0, 0, 0, 0, 0, 0, 0],
        }
    }

    pub(crate) fn echo_reply_from(source: Ipv4Addr, identifier: u16, sequence: u16) -> Datagram {
        let mut buff = EchoRequest::new(identifier, sequence, 0.0).to_bytes().unwrap();
        buff[0] = 0;
        Datagram { source, icmp: buff }
    }

    impl MockFactory {
        pub(crate) fn new() -> MockFactory {
            MockFactory {
                net: Rc::new(RefCell::new(MockNet::default())),
            }
        }
        pub(crate) fn respond(&self, ttl: u8, addr: Ipv4Addr) {
            self.net.borrow_mut().responders.insert(ttl, addr);
        }
        pub(crate) fn script(&self, ttl: u8, script: Script) {
            self.net
                .borrow_mut()
                .scripts
                .entry(ttl)
                .or_default()
                .push_back(script);
        }
        pub(crate) fn events(&self) -> Vec<Event> {
            self.net.borrow().events.clone()
        }
    }

    impl ChannelFactory for MockFactory {
        type Channel = MockChannel;
        fn open(&mut self, ttl: u8) -> Result<MockChannel, TraceError> {
            let mut net = self.net.borrow_mut();
            if net.refuse_open {
                return Err(TraceError::Privilege {
                    source: io::Error::from(ErrorKind::PermissionDenied),
                });
            }
            net.events.push(Event::Open(ttl));
            Ok(MockChannel {
                ttl,
                net: self.net.clone(),
                inbox: VecDeque::new(),
                recv_error: None,
            })
        }
    }

    impl ProbeChannel for MockChannel {
        fn send(&mut self, packet: &[u8], _destination: Ipv4Addr) -> io::Result<()> {
            let request = EchoRequest::from_bytes(packet).expect("valid probe");
            let mut net = self.net.borrow_mut();
            net.events.push(Event::Send(self.ttl, request.sequence));
            let script = net.scripts.get_mut(&self.ttl).and_then(|q| q.pop_front());
            let script = match script {
                Some(s) => s,
                None => match net.responders.get(&self.ttl) {
                    Some(addr) => Script::Reply(time_exceeded_from(*addr)),
                    None => Script::Silent,
                },
            };
            match script {
                Script::Reply(d) => self.inbox.push_back(d),
                Script::Burst(ds) => self.inbox.extend(ds),
                Script::Silent => (),
                Script::SendError(kind) => return Err(io::Error::from(kind)),
                Script::RecvError(kind) => self.recv_error = Some(kind),
            }
            Ok(())
        }
        fn recv(&mut self, _timeout: Duration) -> io::Result<Option<Datagram>> {
            if let Some(kind) = self.recv_error.take() {
                return Err(io::Error::from(kind));
            }
            Ok(self.inbox.pop_front())
        }
    }

    impl Drop for MockChannel {
        fn drop(&mut self) {
            self.net.borrow_mut().events.push(Event::Close(self.ttl));
        }
    }

    fn session() -> TraceSession {
        let config = TraceConfig {
            timeout: Duration::from_millis(200),
            ..TraceConfig::default()
        };
        TraceSession::new(Ipv4Addr::new(10, 0, 0, 9), config)
    }

    #[test]
    fn test_send_error_classification() {
        assert!(send_error_is_fatal(&io::Error::from(ErrorKind::PermissionDenied)));
        assert!(!send_error_is_fatal(&io::Error::from(ErrorKind::HostUnreachable)));
        assert!(!send_error_is_fatal(&io::Error::other("no route")));
        #[cfg(unix)]
        assert!(send_error_is_fatal(&io::Error::from_raw_os_error(EBADF)));
    }
    #[test]
    fn test_probe_hop_replies() {
        let mut factory = MockFactory::new();
        let router = Ipv4Addr::new(192, 168, 1, 1);
        factory.respond(1, router);
        let mut session = session();
        let hop = probe_hop(&mut factory, &mut session, 1).unwrap();
        assert_eq!(hop.hop, 1);
        assert_eq!(hop.attempts.len(), 3);
        assert_eq!(hop.responder, Some(router));
        assert_eq!(hop.replies(), 3);
        for a in &hop.attempts {
            match a.outcome {
                ProbeOutcome::Reply { responder, kind, .. } => {
                    assert_eq!(responder, router);
                    assert_eq!(kind, ReplyKind::TimeExceeded);
                }
                ProbeOutcome::Timeout => panic!("unexpected timeout"),
            }
        }
        assert_eq!(
            factory.events(),
            vec![
                Event::Open(1),
                Event::Send(1, 0),
                Event::Send(1, 1),
                Event::Send(1, 2),
                Event::Close(1)
            ]
        );
    }
    #[test]
    fn test_probe_hop_all_timeout() {
        let mut factory = MockFactory::new();
        let mut session = session();
        let hop = probe_hop(&mut factory, &mut session, 4).unwrap();
        assert!(hop.all_timed_out());
        assert_eq!(hop.responder, None);
        assert_eq!(hop.loss(), 1.0);
    }
    #[test]
    fn test_probe_hop_partial_and_last_responder() {
        let mut factory = MockFactory::new();
        let a = Ipv4Addr::new(10, 1, 1, 1);
        let b = Ipv4Addr::new(10, 1, 1, 2);
        factory.script(2, Script::Reply(time_exceeded_from(a)));
        factory.script(2, Script::Silent);
        factory.script(2, Script::Reply(time_exceeded_from(b)));
        let mut session = session();
        let hop = probe_hop(&mut factory, &mut session, 2).unwrap();
        assert_eq!(hop.attempts[1].outcome, ProbeOutcome::Timeout);
        assert_eq!(hop.responder, Some(b));
        assert_eq!(hop.replies(), 2);
    }
    #[test]
    fn test_send_error_counts_as_timeout() {
        let mut factory = MockFactory::new();
        let router = Ipv4Addr::new(172, 16, 0, 1);
        factory.respond(3, router);
        factory.script(3, Script::SendError(ErrorKind::HostUnreachable));
        let mut session = session();
        let hop = probe_hop(&mut factory, &mut session, 3).unwrap();
        assert_eq!(hop.attempts[0].outcome, ProbeOutcome::Timeout);
        assert_eq!(hop.replies(), 2);
        assert_eq!(factory.events().last(), Some(&Event::Close(3)));
    }
    #[test]
    fn test_send_permission_denied_is_fatal_and_closes() {
        let mut factory = MockFactory::new();
        factory.script(1, Script::SendError(ErrorKind::PermissionDenied));
        let mut session = session();
        let ret = probe_hop(&mut factory, &mut session, 1);
        assert!(matches!(ret, Err(TraceError::Privilege { .. })));
        assert_eq!(
            factory.events(),
            vec![Event::Open(1), Event::Send(1, 0), Event::Close(1)]
        );
    }
    #[test]
    fn test_recv_fault_is_fatal_and_closes() {
        let mut factory = MockFactory::new();
        factory.script(5, Script::RecvError(ErrorKind::ConnectionReset));
        let mut session = session();
        let ret = probe_hop(&mut factory, &mut session, 5);
        assert!(matches!(ret, Err(TraceError::SocketFault { ttl: 5, .. })));
        assert_eq!(factory.events().last(), Some(&Event::Close(5)));
    }
    #[test]
    fn test_recv_would_block_is_timeout() {
        let mut factory = MockFactory::new();
        factory.script(1, Script::RecvError(ErrorKind::WouldBlock));
        let mut session = session();
        let hop = probe_hop(&mut factory, &mut session, 1).unwrap();
        assert_eq!(hop.attempts[0].outcome, ProbeOutcome::Timeout);
    }
    #[test]
    fn test_open_failure_propagates() {
        let mut factory = MockFactory::new();
        factory.net.borrow_mut().refuse_open = true;
        let mut session = session();
        let ret = probe_hop(&mut factory, &mut session, 1);
        assert!(matches!(ret, Err(TraceError::Privilege { .. })));
        assert!(factory.events().is_empty());
    }
    #[test]
    fn test_first_datagram_wins() {
        let mut factory = MockFactory::new();
        let stray = Ipv4Addr::new(8, 8, 8, 8);
        let router = Ipv4Addr::new(10, 0, 0, 1);
        // echo reply for someone else's ping arrives first
        factory.script(
            1,
            Script::Burst(vec![
                echo_reply_from(stray, 999, 77),
                time_exceeded_from(router),
            ]),
        );
        let mut session = session();
        let hop = probe_hop(&mut factory, &mut session, 1).unwrap();
        match hop.attempts[0].outcome {
            ProbeOutcome::Reply { responder, kind, .. } => {
                assert_eq!(responder, stray);
                assert_eq!(kind, ReplyKind::EchoReply);
            }
            ProbeOutcome::Timeout => panic!("expected a reply"),
        }
    }
    #[test]
    fn test_strict_skips_unrelated() {
        let mut factory = MockFactory::new();
        let stray = Ipv4Addr::new(8, 8, 8, 8);
        let target = Ipv4Addr::new(10, 0, 0, 9);
        let mut session = session();
        session.config.reply_match = ReplyMatch::Strict;
        let id = session.identifier();
        factory.script(
            1,
            Script::Burst(vec![
                echo_reply_from(stray, 999, 0),
                echo_reply_from(target, id, 0),
            ]),
        );
        let hop = probe_hop(&mut factory, &mut session, 1).unwrap();
        match hop.attempts[0].outcome {
            ProbeOutcome::Reply { responder, .. } => assert_eq!(responder, target),
            ProbeOutcome::Timeout => panic!("expected a reply"),
        }
        // the second and third probes only see silence
        assert_eq!(hop.replies(), 1);
    }
    #[test]
    fn test_strict_times_out_on_stale_sequence() {
        let mut factory = MockFactory::new();
        let target = Ipv4Addr::new(10, 0, 0, 9);
        let mut session = session();
        session.config.reply_match = ReplyMatch::Strict;
        session.config.attempts_per_hop = 1;
        let id = session.identifier();
        factory.script(1, Script::Reply(echo_reply_from(target, id, 41)));
        let hop = probe_hop(&mut factory, &mut session, 1).unwrap();
        assert!(hop.all_timed_out());
    }
}
