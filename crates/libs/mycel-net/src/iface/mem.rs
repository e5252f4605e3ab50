//! In-process link driver. Backs same-host loopback links and lets the
//! kernel test suites run a whole overlay without sockets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use mycel_core::hostinfo::{AddrFamily, LowLevelAddress};
use mycel_core::url::LinkUrl;

use crate::error::NetError;
use crate::iface::{
    FrameLink, LinkDriver, Listener, PendingDial, LINK_RX_CAPACITY, LINK_TX_CAPACITY,
};

/// Cross-wired pair of frame links, both loopback.
pub fn frame_pipe() -> (FrameLink, FrameLink) {
    let (a_tx, b_rx) = mpsc::channel(LINK_TX_CAPACITY);
    let (b_tx, a_rx) = mpsc::channel(LINK_RX_CAPACITY);
    let stop = CancellationToken::new();

    let a = FrameLink::new(a_tx, a_rx, None, true, stop.clone());
    let b = FrameLink::new(b_tx, b_rx, None, true, stop);

    (a, b)
}

type AcceptSink = mpsc::Sender<FrameLink>;

/// Process-wide "wiring closet": host:port endpoints of every listening
/// [`MemDriver`] sharing the registry.
#[derive(Clone, Default)]
pub struct MemRegistry {
    endpoints: Arc<Mutex<HashMap<(String, u16), AcceptSink>>>,
}

impl MemRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Stream-family driver over in-process channels. Dials resolve
/// immediately; every link reports loopback.
pub struct MemDriver {
    registry: MemRegistry,
    host: String,
    listen_sinks: Vec<(u16, AcceptSink)>,
}

impl MemDriver {
    pub fn new(registry: MemRegistry, host: &str) -> Self {
        Self { registry, host: host.to_string(), listen_sinks: Vec::new() }
    }
}

impl LinkDriver for MemDriver {
    fn family(&self) -> AddrFamily {
        AddrFamily::Stream
    }

    fn listen(&mut self, port: u16) -> Result<Listener, NetError> {
        let mut endpoints = self.registry.endpoints.lock().map_err(|_| NetError::DriverFailure)?;

        let mut bound = port;
        loop {
            if !endpoints.contains_key(&(self.host.clone(), bound)) {
                break;
            }
            bound = bound.checked_add(1).ok_or(NetError::PortsExhausted)?;
        }

        let (accept_tx, accept_rx) = mpsc::channel(16);
        endpoints.insert((self.host.clone(), bound), accept_tx.clone());
        self.listen_sinks.push((bound, accept_tx));

        let local = vec![LowLevelAddress::ipv4(AddrFamily::Stream, [127, 0, 0, 1], bound, true)];
        Ok(Listener::new(accept_rx, local, bound, CancellationToken::new()))
    }

    fn dial(&mut self, url: &LinkUrl) -> Result<PendingDial, NetError> {
        let LinkUrl::Tcp { host, port } = url else {
            return Err(NetError::DriverFailure);
        };

        let (done_tx, done_rx) = oneshot::channel();
        let endpoints = self.registry.endpoints.lock().map_err(|_| NetError::DriverFailure)?;

        match endpoints.get(&(host.clone(), *port)) {
            Some(sink) => {
                let (ours, theirs) = frame_pipe();
                if sink.try_send(theirs).is_ok() {
                    let _ = done_tx.send(Ok(ours));
                } else {
                    let _ = done_tx.send(Err(NetError::DriverFailure));
                }
            }
            None => {
                let _ = done_tx.send(Err(NetError::DriverFailure));
            }
        }

        Ok(PendingDial::new(url.clone(), done_rx))
    }

    fn local_addresses(&self) -> Vec<LowLevelAddress> {
        self.listen_sinks
            .iter()
            .map(|(port, _)| LowLevelAddress::ipv4(AddrFamily::Stream, [127, 0, 0, 1], *port, true))
            .collect()
    }

    fn is_reachable(&self, url: &LinkUrl) -> bool {
        matches!(url, LinkUrl::Tcp { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::{DialState, FrameEvent, SendOutcome};

    #[test]
    fn pipe_carries_frames_both_ways() {
        let (a, mut b) = frame_pipe();
        assert_eq!(a.send_frame(b"ping".to_vec()), SendOutcome::Sent);
        assert_eq!(b.recv_frame(), FrameEvent::Frame(b"ping".to_vec()));
        assert_eq!(b.recv_frame(), FrameEvent::Empty);
    }

    #[test]
    fn dropping_one_end_breaks_the_pipe() {
        let (a, mut b) = frame_pipe();
        drop(a);
        assert_eq!(b.recv_frame(), FrameEvent::PipeBroken);
    }

    #[test]
    fn dial_reaches_a_listening_driver() {
        let registry = MemRegistry::new();
        let mut server = MemDriver::new(registry.clone(), "alpha");
        let mut listener = server.listen(8000).expect("listen");

        let mut client = MemDriver::new(registry, "beta");
        let url = "tcp://alpha:8000".parse().expect("url");
        let mut dial = client.dial(&url).expect("dial");

        let (state, link) = dial.poll();
        assert!(matches!(state, DialState::Established));
        let link = link.expect("established link");

        let mut accepted = listener.accept().expect("accepted link");
        assert_eq!(link.send_frame(b"hello".to_vec()), SendOutcome::Sent);
        assert_eq!(accepted.recv_frame(), FrameEvent::Frame(b"hello".to_vec()));
    }

    #[test]
    fn taken_port_binds_the_next_one_up() {
        let registry = MemRegistry::new();
        let mut driver = MemDriver::new(registry, "alpha");
        let first = driver.listen(9000).expect("listen");
        let second = driver.listen(9000).expect("listen");
        assert_eq!(first.port(), 9000);
        assert_eq!(second.port(), 9001);
    }
}
