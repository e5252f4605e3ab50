pub mod beacon;
pub mod framing;
pub mod mem;
pub mod tcp;
pub mod udp;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use mycel_core::hostinfo::{AddrFamily, LowLevelAddress};
use mycel_core::url::LinkUrl;

use crate::error::NetError;

/// Frames queued towards a driver task per link.
pub const LINK_TX_CAPACITY: usize = 64;
/// Frames buffered from a driver task per link.
pub const LINK_RX_CAPACITY: usize = 64;

#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    WouldBlock,
    PipeBroken,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FrameEvent {
    Empty,
    Frame(Vec<u8>),
    PipeBroken,
}

/// One established link as the kernel sees it: whole frames in, whole
/// frames out, never blocking. The transport-specific work (sockets,
/// stream framing, reconnection of the byte pipe) lives in a driver task
/// behind the channel pair.
pub struct FrameLink {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
    remote_url: Option<LinkUrl>,
    is_loopback: bool,
    stop: CancellationToken,
}

impl FrameLink {
    pub fn new(
        tx: mpsc::Sender<Vec<u8>>,
        rx: mpsc::Receiver<Vec<u8>>,
        remote_url: Option<LinkUrl>,
        is_loopback: bool,
        stop: CancellationToken,
    ) -> Self {
        Self { tx, rx, remote_url, is_loopback, stop }
    }

    pub fn send_frame(&self, frame: Vec<u8>) -> SendOutcome {
        match self.tx.try_send(frame) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::WouldBlock,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::PipeBroken,
        }
    }

    pub fn recv_frame(&mut self) -> FrameEvent {
        match self.rx.try_recv() {
            Ok(frame) => FrameEvent::Frame(frame),
            Err(mpsc::error::TryRecvError::Empty) => FrameEvent::Empty,
            Err(mpsc::error::TryRecvError::Disconnected) => FrameEvent::PipeBroken,
        }
    }

    pub fn remote_url(&self) -> Option<&LinkUrl> {
        self.remote_url.as_ref()
    }

    pub fn is_loopback(&self) -> bool {
        self.is_loopback
    }

    /// Tells the driver task to tear the transport down. Safe to call more
    /// than once.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }
}

impl Drop for FrameLink {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[derive(Debug)]
pub enum DialState {
    Pending,
    Established,
    Failed,
}

/// Non-blocking outbound connection attempt.
pub struct PendingDial {
    url: LinkUrl,
    rx: oneshot::Receiver<Result<FrameLink, NetError>>,
}

impl PendingDial {
    pub fn new(url: LinkUrl, rx: oneshot::Receiver<Result<FrameLink, NetError>>) -> Self {
        Self { url, rx }
    }

    pub fn url(&self) -> &LinkUrl {
        &self.url
    }

    /// Polls the attempt; yields the link at most once.
    pub fn poll(&mut self) -> (DialState, Option<FrameLink>) {
        match self.rx.try_recv() {
            Ok(Ok(link)) => (DialState::Established, Some(link)),
            Ok(Err(_)) => (DialState::Failed, None),
            Err(oneshot::error::TryRecvError::Empty) => (DialState::Pending, None),
            Err(oneshot::error::TryRecvError::Closed) => (DialState::Failed, None),
        }
    }
}

/// An accepting endpoint. Inbound links appear on the channel once their
/// transport handshake (not the protocol greeting) is complete.
pub struct Listener {
    accepts: mpsc::Receiver<FrameLink>,
    local_addresses: Vec<LowLevelAddress>,
    port: u16,
    stop: CancellationToken,
}

impl Listener {
    pub fn new(
        accepts: mpsc::Receiver<FrameLink>,
        local_addresses: Vec<LowLevelAddress>,
        port: u16,
        stop: CancellationToken,
    ) -> Self {
        Self { accepts, local_addresses, port, stop }
    }

    pub fn accept(&mut self) -> Option<FrameLink> {
        self.accepts.try_recv().ok()
    }

    pub fn local_addresses(&self) -> &[LowLevelAddress] {
        &self.local_addresses
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// One per transport family. All calls are non-blocking; the kernel step
/// polls the returned handles.
pub trait LinkDriver: Send {
    fn family(&self) -> AddrFamily;

    /// Starts accepting. Binds the next free port upward when the
    /// requested one is taken.
    fn listen(&mut self, port: u16) -> Result<Listener, NetError>;

    fn dial(&mut self, url: &LinkUrl) -> Result<PendingDial, NetError>;

    fn local_addresses(&self) -> Vec<LowLevelAddress>;

    /// Best-effort guess whether a dial to `url` could succeed, used to
    /// rank connection candidates.
    fn is_reachable(&self, url: &LinkUrl) -> bool;
}
