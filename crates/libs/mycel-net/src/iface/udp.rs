//! Datagram-family link driver. Each datagram is one frame; no stream
//! codec is involved. Inbound traffic on a listening socket is demuxed by
//! source address into per-peer frame links.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use mycel_core::hostinfo::{AddrFamily, LowLevelAddress};
use mycel_core::package::{HEADER_LEN, MAX_PAYLOAD};
use mycel_core::url::LinkUrl;

use crate::error::NetError;
use crate::iface::{
    FrameLink, LinkDriver, Listener, PendingDial, LINK_RX_CAPACITY, LINK_TX_CAPACITY,
};

const DATAGRAM_MAX: usize = HEADER_LEN + MAX_PAYLOAD;
const LISTEN_PORT_PROBES: u16 = 100;

pub struct UdpDriver {
    handle: tokio::runtime::Handle,
    cancel: CancellationToken,
    bound_ports: Vec<u16>,
}

impl UdpDriver {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle, cancel: CancellationToken::new(), bound_ports: Vec::new() }
    }
}

impl Drop for UdpDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn bind_with_probes(port: u16) -> Result<(std::net::UdpSocket, u16), NetError> {
    let mut bound = port;
    loop {
        match std::net::UdpSocket::bind(("0.0.0.0", bound)) {
            Ok(socket) => {
                socket.set_nonblocking(true).map_err(|_| NetError::DriverFailure)?;
                return Ok((socket, bound));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                if bound >= port.saturating_add(LISTEN_PORT_PROBES) {
                    return Err(NetError::PortsExhausted);
                }
                bound += 1;
            }
            Err(err) => {
                log::warn!("udp: bind on {bound} failed: {err}");
                return Err(NetError::DriverFailure);
            }
        }
    }
}

impl LinkDriver for UdpDriver {
    fn family(&self) -> AddrFamily {
        AddrFamily::Datagram
    }

    fn listen(&mut self, port: u16) -> Result<Listener, NetError> {
        let (std_socket, bound) = bind_with_probes(port)?;

        let (accept_tx, accept_rx) = mpsc::channel::<FrameLink>(16);
        let stop = self.cancel.child_token();

        {
            let stop = stop.clone();
            let handle = self.handle.clone();
            self.handle.spawn(async move {
                let socket = match UdpSocket::from_std(std_socket) {
                    Ok(socket) => Arc::new(socket),
                    Err(err) => {
                        log::warn!("udp: socket registration failed: {err}");
                        return;
                    }
                };

                let mut peers: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
                let mut buf = [0u8; DATAGRAM_MAX];

                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        received = socket.recv_from(&mut buf) => {
                            let Ok((n, from)) = received else { continue };
                            let frame = buf[..n].to_vec();

                            let mut stale = false;
                            if let Some(sender) = peers.get(&from) {
                                if sender.try_send(frame).is_ok() {
                                    continue;
                                }
                                if sender.is_closed() {
                                    stale = true;
                                } else {
                                    continue; // backlog full, datagram dropped
                                }
                            }
                            if stale {
                                peers.remove(&from);
                            }

                            // New source: build a demuxed link for it.
                            let (kernel_tx, mut task_rx) = mpsc::channel::<Vec<u8>>(LINK_TX_CAPACITY);
                            let (task_tx, kernel_rx) = mpsc::channel::<Vec<u8>>(LINK_RX_CAPACITY);
                            let _ = task_tx.try_send(buf[..n].to_vec());
                            peers.insert(from, task_tx);

                            let url = match from {
                                SocketAddr::V4(v4) => Some(LinkUrl::Udp {
                                    host: v4.ip().to_string(),
                                    port: v4.port(),
                                }),
                                _ => None,
                            };
                            let is_loopback = from.ip().is_loopback();
                            let link_stop = stop.child_token();

                            {
                                let socket = socket.clone();
                                let link_stop = link_stop.clone();
                                handle.spawn(async move {
                                    loop {
                                        tokio::select! {
                                            _ = link_stop.cancelled() => break,
                                            frame = task_rx.recv() => {
                                                let Some(frame) = frame else { break };
                                                if socket.send_to(&frame, from).await.is_err() {
                                                    link_stop.cancel();
                                                    break;
                                                }
                                            }
                                        }
                                    }
                                });
                            }

                            let link =
                                FrameLink::new(kernel_tx, kernel_rx, url, is_loopback, link_stop);
                            if accept_tx.try_send(link).is_err() {
                                log::debug!("udp: accept backlog full, dropping {from}");
                                peers.remove(&from);
                            }
                        }
                    }
                }
            });
        }

        self.bound_ports.push(bound);

        let local =
            vec![LowLevelAddress::ipv4(AddrFamily::Datagram, [127, 0, 0, 1], bound, true)];
        Ok(Listener::new(accept_rx, local, bound, stop))
    }

    fn dial(&mut self, url: &LinkUrl) -> Result<PendingDial, NetError> {
        let LinkUrl::Udp { .. } = url else {
            return Err(NetError::DriverFailure);
        };
        let addr = url.socket_addr().ok_or(NetError::DriverFailure)?;

        let (done_tx, done_rx) = oneshot::channel();
        let stop = self.cancel.child_token();
        let dial_url = url.clone();

        self.handle.spawn(async move {
            let socket = match UdpSocket::bind("0.0.0.0:0").await {
                Ok(socket) => socket,
                Err(err) => {
                    log::debug!("udp: bind for dial failed: {err}");
                    let _ = done_tx.send(Err(NetError::DriverFailure));
                    return;
                }
            };
            if let Err(err) = socket.connect(&addr).await {
                log::debug!("udp: connect to {addr} failed: {err}");
                let _ = done_tx.send(Err(NetError::DriverFailure));
                return;
            }

            let is_loopback = socket
                .peer_addr()
                .map(|peer| peer.ip().is_loopback())
                .unwrap_or(false);

            let (kernel_tx, mut task_rx) = mpsc::channel::<Vec<u8>>(LINK_TX_CAPACITY);
            let (task_tx, kernel_rx) = mpsc::channel::<Vec<u8>>(LINK_RX_CAPACITY);

            let link = FrameLink::new(kernel_tx, kernel_rx, Some(dial_url), is_loopback, stop.clone());
            if done_tx.send(Ok(link)).is_err() {
                return;
            }

            let mut buf = [0u8; DATAGRAM_MAX];
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    frame = task_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if socket.send(&frame).await.is_err() {
                            stop.cancel();
                            break;
                        }
                    }
                    received = socket.recv(&mut buf) => {
                        match received {
                            Ok(n) => {
                                if task_tx.send(buf[..n].to_vec()).await.is_err() {
                                    stop.cancel();
                                    break;
                                }
                            }
                            Err(err) => {
                                log::debug!("udp: recv failed: {err}");
                                stop.cancel();
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(PendingDial::new(url.clone(), done_rx))
    }

    fn local_addresses(&self) -> Vec<LowLevelAddress> {
        self.bound_ports
            .iter()
            .map(|&port| LowLevelAddress::ipv4(AddrFamily::Datagram, [127, 0, 0, 1], port, true))
            .collect()
    }

    fn is_reachable(&self, url: &LinkUrl) -> bool {
        matches!(url, LinkUrl::Udp { .. })
    }
}
