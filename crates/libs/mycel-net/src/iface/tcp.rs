//! Stream-family link driver over TCP. The byte stream is cut into whole
//! frames with the sync/length/checksum codec; each established socket is
//! owned by a reader and a writer task bridging it to the kernel's frame
//! channels.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use mycel_core::hostinfo::{AddrFamily, LowLevelAddress};
use mycel_core::package::{HEADER_LEN, MAX_PAYLOAD};
use mycel_core::url::LinkUrl;

use crate::error::NetError;
use crate::iface::framing::FrameCodec;
use crate::iface::{
    FrameLink, LinkDriver, Listener, PendingDial, LINK_RX_CAPACITY, LINK_TX_CAPACITY,
};

/// Largest frame a stream link will carry: one whole package.
pub const STREAM_MAX_FRAME: usize = HEADER_LEN + MAX_PAYLOAD;

const LISTEN_PORT_PROBES: u16 = 100;
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const READ_CHUNK: usize = 4096;

pub struct TcpDriver {
    handle: tokio::runtime::Handle,
    cancel: CancellationToken,
    bound_ports: Vec<u16>,
}

impl TcpDriver {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle, cancel: CancellationToken::new(), bound_ports: Vec::new() }
    }
}

impl Drop for TcpDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Guesses the address other hosts would reach us at. No packets are sent;
/// the connect only asks the routing table.
fn primary_ipv4() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("10.254.254.254:1").ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(v4) if !v4.ip().is_loopback() && !v4.ip().is_unspecified() => Some(*v4.ip()),
        _ => None,
    }
}

fn is_private(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 10
        || (octets[0] == 172 && (16..=31).contains(&octets[1]))
        || (octets[0] == 192 && octets[1] == 168)
}

/// Spawns the reader/writer pair for an established stream and returns the
/// kernel-side frame link.
pub(crate) fn spawn_stream_link(
    handle: &tokio::runtime::Handle,
    stream: TcpStream,
    remote_url: Option<LinkUrl>,
    parent: &CancellationToken,
) -> FrameLink {
    let is_loopback =
        stream.peer_addr().map(|addr| addr.ip().is_loopback()).unwrap_or(false);

    let (kernel_tx, mut task_rx) = mpsc::channel::<Vec<u8>>(LINK_TX_CAPACITY);
    let (task_tx, kernel_rx) = mpsc::channel::<Vec<u8>>(LINK_RX_CAPACITY);
    let stop = parent.child_token();
    let codec = FrameCodec::stream(STREAM_MAX_FRAME);

    let (mut read_half, mut write_half) = stream.into_split();

    {
        let stop = stop.clone();
        handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    frame = task_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let encoded = match codec.encode(&frame) {
                            Ok(encoded) => encoded,
                            Err(_) => {
                                log::warn!("tcp: refusing oversized frame ({} bytes)", frame.len());
                                continue;
                            }
                        };
                        if let Err(err) = write_half.write_all(&encoded).await {
                            log::debug!("tcp: write failed: {err}");
                            stop.cancel();
                            break;
                        }
                    }
                }
            }
        });
    }

    {
        let stop = stop.clone();
        handle.spawn(async move {
            let mut decoder = codec.decoder();
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    result = read_half.read(&mut chunk) => {
                        match result {
                            Ok(0) => {
                                stop.cancel();
                                break;
                            }
                            Ok(n) => {
                                for frame in decoder.feed(&chunk[..n]) {
                                    if task_tx.send(frame).await.is_err() {
                                        stop.cancel();
                                        return;
                                    }
                                }
                            }
                            Err(err) => {
                                log::debug!("tcp: read failed: {err}");
                                stop.cancel();
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    FrameLink::new(kernel_tx, kernel_rx, remote_url, is_loopback, stop)
}

impl LinkDriver for TcpDriver {
    fn family(&self) -> AddrFamily {
        AddrFamily::Stream
    }

    fn listen(&mut self, port: u16) -> Result<Listener, NetError> {
        let mut bound = port;
        let std_listener = loop {
            match std::net::TcpListener::bind(("0.0.0.0", bound)) {
                Ok(listener) => break listener,
                Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                    if bound >= port.saturating_add(LISTEN_PORT_PROBES) {
                        return Err(NetError::PortsExhausted);
                    }
                    bound += 1;
                }
                Err(err) => {
                    log::warn!("tcp: listen on {bound} failed: {err}");
                    return Err(NetError::DriverFailure);
                }
            }
        };
        std_listener.set_nonblocking(true).map_err(|_| NetError::DriverFailure)?;

        let (accept_tx, accept_rx) = mpsc::channel(16);
        let stop = self.cancel.child_token();
        let handle = self.handle.clone();

        {
            let stop = stop.clone();
            let task_handle = handle.clone();
            self.handle.spawn(async move {
                let listener = match tokio::net::TcpListener::from_std(std_listener) {
                    Ok(listener) => listener,
                    Err(err) => {
                        log::warn!("tcp: listener registration failed: {err}");
                        return;
                    }
                };

                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        accepted = listener.accept() => {
                            match accepted {
                                Ok((stream, peer)) => {
                                    log::debug!("tcp: accepted {peer}");
                                    let url = match peer {
                                        SocketAddr::V4(v4) => Some(LinkUrl::Tcp {
                                            host: v4.ip().to_string(),
                                            port: v4.port(),
                                        }),
                                        _ => None,
                                    };
                                    let link = spawn_stream_link(&task_handle, stream, url, &stop);
                                    if accept_tx.try_send(link).is_err() {
                                        log::debug!("tcp: accept backlog full, dropping {peer}");
                                    }
                                }
                                Err(err) => {
                                    log::debug!("tcp: accept failed: {err}");
                                }
                            }
                        }
                    }
                }
            });
        }

        self.bound_ports.push(bound);

        let mut local =
            vec![LowLevelAddress::ipv4(AddrFamily::Stream, [127, 0, 0, 1], bound, true)];
        if let Some(ip) = primary_ipv4() {
            local.push(LowLevelAddress::ipv4(AddrFamily::Stream, ip.octets(), bound, false));
        }

        Ok(Listener::new(accept_rx, local, bound, stop))
    }

    fn dial(&mut self, url: &LinkUrl) -> Result<PendingDial, NetError> {
        let LinkUrl::Tcp { .. } = url else {
            return Err(NetError::DriverFailure);
        };
        let addr = url.socket_addr().ok_or(NetError::DriverFailure)?;

        let (done_tx, done_rx) = oneshot::channel();
        let stop = self.cancel.clone();
        let handle = self.handle.clone();
        let dial_url = url.clone();

        self.handle.spawn(async move {
            let attempt = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr));
            let outcome = match attempt.await {
                Ok(Ok(stream)) => {
                    log::debug!("tcp: connected to {addr}");
                    Ok(spawn_stream_link(&handle, stream, Some(dial_url), &stop))
                }
                Ok(Err(err)) => {
                    log::debug!("tcp: connect to {addr} failed: {err}");
                    Err(NetError::DriverFailure)
                }
                Err(_) => {
                    log::debug!("tcp: connect to {addr} timed out");
                    Err(NetError::DriverFailure)
                }
            };
            let _ = done_tx.send(outcome);
        });

        Ok(PendingDial::new(url.clone(), done_rx))
    }

    fn local_addresses(&self) -> Vec<LowLevelAddress> {
        let mut addresses = Vec::new();
        for &port in &self.bound_ports {
            addresses.push(LowLevelAddress::ipv4(AddrFamily::Stream, [127, 0, 0, 1], port, true));
            if let Some(ip) = primary_ipv4() {
                addresses.push(LowLevelAddress::ipv4(AddrFamily::Stream, ip.octets(), port, false));
            }
        }
        addresses
    }

    fn is_reachable(&self, url: &LinkUrl) -> bool {
        let (LinkUrl::Tcp { host, .. } | LinkUrl::Udp { host, .. }) = url else {
            return false;
        };

        match host.parse::<Ipv4Addr>() {
            Ok(ip) if ip.is_loopback() => true,
            // Public addresses are assumed routable; private ones only when
            // we sit in the same private network.
            Ok(ip) if is_private(ip) => match primary_ipv4() {
                Some(ours) => is_private(ours) && ours.octets()[..2] == ip.octets()[..2],
                None => false,
            },
            Ok(_) => true,
            // Resolvable names are left to the dial attempt.
            Err(_) => true,
        }
    }
}
