//! Multicast discovery channel. One UDP socket joined to the discovery
//! group carries small broadcast beacons; the kernel's discovery periodic
//! writes them and the step loop drains what other peers sent. Where a
//! beacon came from is immaterial: the host record inside it carries the
//! peer's reachable addresses.

use std::net::{Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::NetError;

const BEACON_MAX: usize = 2048;
const BEACON_QUEUE: usize = 32;

pub struct BeaconChannel {
    out_tx: mpsc::Sender<Vec<u8>>,
    in_rx: mpsc::Receiver<Vec<u8>>,
    stop: CancellationToken,
}

impl BeaconChannel {
    /// Queues one beacon for the whole group. Quietly drops when the
    /// channel is congested; beacons are periodic and redundant.
    pub fn broadcast_beacon(&self, bytes: Vec<u8>) {
        let _ = self.out_tx.try_send(bytes);
    }

    pub fn recv_beacon(&mut self) -> Option<Vec<u8>> {
        self.in_rx.try_recv().ok()
    }
}

impl Drop for BeaconChannel {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn multicast_socket(group: Ipv4Addr, port: u16) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Joins the multicast group and spawns the socket task.
pub fn spawn_multicast(
    handle: &tokio::runtime::Handle,
    group: Ipv4Addr,
    port: u16,
) -> Result<BeaconChannel, NetError> {
    let std_socket = multicast_socket(group, port).map_err(|err| {
        log::warn!("beacon: joining {group}:{port} failed: {err}");
        NetError::DriverFailure
    })?;

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(BEACON_QUEUE);
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(BEACON_QUEUE);
    let stop = CancellationToken::new();

    {
        let stop = stop.clone();
        handle.spawn(async move {
            let socket = match UdpSocket::from_std(std_socket) {
                Ok(socket) => socket,
                Err(err) => {
                    log::warn!("beacon: socket registration failed: {err}");
                    return;
                }
            };
            let target = SocketAddr::from((group, port));
            let mut buf = [0u8; BEACON_MAX];

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    beacon = out_rx.recv() => {
                        let Some(beacon) = beacon else { break };
                        if let Err(err) = socket.send_to(&beacon, target).await {
                            log::debug!("beacon: send failed: {err}");
                        }
                    }
                    received = socket.recv_from(&mut buf) => {
                        if let Ok((n, _from)) = received {
                            let _ = in_tx.try_send(buf[..n].to_vec());
                        }
                    }
                }
            }
        });
    }

    Ok(BeaconChannel { out_tx, in_rx, stop })
}

/// Channel pair for tests and single-host setups: beacons written by one
/// side arrive at the other, as if both sat on the same segment.
pub fn beacon_pipe() -> (BeaconChannel, BeaconChannel) {
    let (a_tx, b_rx) = mpsc::channel(BEACON_QUEUE);
    let (b_tx, a_rx) = mpsc::channel(BEACON_QUEUE);
    let stop = CancellationToken::new();

    let a = BeaconChannel { out_tx: a_tx, in_rx: a_rx, stop: stop.clone() };
    let b = BeaconChannel { out_tx: b_tx, in_rx: b_rx, stop };
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_delivers_beacons_to_the_other_side() {
        let (a, mut b) = beacon_pipe();
        a.broadcast_beacon(b"announce".to_vec());
        assert_eq!(b.recv_beacon(), Some(b"announce".to_vec()));
        assert_eq!(b.recv_beacon(), None);
    }
}
