use core::fmt;
use core::str::FromStr;

use crate::error::CoreError;
use crate::hostinfo::{AddrFamily, LowLevelAddress};

/// Parsed link address: `tcp://HOST:PORT`, `udp://HOST:PORT` or
/// `bt://XX:XX:XX:XX:XX:XX;PORT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkUrl {
    Tcp { host: String, port: u16 },
    Udp { host: String, port: u16 },
    Bt { addr: [u8; 6], port: u8 },
}

impl LinkUrl {
    pub fn family(&self) -> AddrFamily {
        match self {
            LinkUrl::Tcp { .. } => AddrFamily::Stream,
            LinkUrl::Udp { .. } => AddrFamily::Datagram,
            LinkUrl::Bt { .. } => AddrFamily::L2cap,
        }
    }

    /// Socket-address form for IP transports (`host:port`).
    pub fn socket_addr(&self) -> Option<String> {
        match self {
            LinkUrl::Tcp { host, port } | LinkUrl::Udp { host, port } => {
                Some(format!("{host}:{port}"))
            }
            LinkUrl::Bt { .. } => None,
        }
    }

    pub fn from_lowlevel(address: &LowLevelAddress) -> Option<LinkUrl> {
        match address.family {
            AddrFamily::Stream | AddrFamily::Datagram if address.raw.len() == 4 => {
                let host = format!(
                    "{}.{}.{}.{}",
                    address.raw[0], address.raw[1], address.raw[2], address.raw[3]
                );
                if address.family == AddrFamily::Stream {
                    Some(LinkUrl::Tcp { host, port: address.port })
                } else {
                    Some(LinkUrl::Udp { host, port: address.port })
                }
            }
            AddrFamily::L2cap if address.raw.len() == 6 => {
                let mut addr = [0u8; 6];
                addr.copy_from_slice(&address.raw);
                Some(LinkUrl::Bt { addr, port: address.port as u8 })
            }
            _ => None,
        }
    }
}

fn parse_host_port(rest: &str) -> Result<(String, u16), CoreError> {
    let (host, port) = rest.rsplit_once(':').ok_or(CoreError::InvalidUrl)?;
    if host.is_empty() {
        return Err(CoreError::InvalidUrl);
    }
    let port = port.parse::<u16>().map_err(|_| CoreError::InvalidUrl)?;
    Ok((host.to_string(), port))
}

fn parse_bt(rest: &str) -> Result<([u8; 6], u8), CoreError> {
    let (addr_part, port_part) = rest.split_once(';').ok_or(CoreError::InvalidUrl)?;
    let octets: Vec<&str> = addr_part.split(':').collect();
    if octets.len() != 6 {
        return Err(CoreError::InvalidUrl);
    }

    let mut addr = [0u8; 6];
    for (slot, octet) in addr.iter_mut().zip(octets) {
        if octet.len() != 2 {
            return Err(CoreError::InvalidUrl);
        }
        *slot = u8::from_str_radix(octet, 16).map_err(|_| CoreError::InvalidUrl)?;
    }

    let port = port_part.parse::<u8>().map_err(|_| CoreError::InvalidUrl)?;
    Ok((addr, port))
}

impl FromStr for LinkUrl {
    type Err = CoreError;

    fn from_str(url: &str) -> Result<Self, CoreError> {
        if let Some(rest) = url.strip_prefix("tcp://") {
            let (host, port) = parse_host_port(rest)?;
            Ok(LinkUrl::Tcp { host, port })
        } else if let Some(rest) = url.strip_prefix("udp://") {
            let (host, port) = parse_host_port(rest)?;
            Ok(LinkUrl::Udp { host, port })
        } else if let Some(rest) = url.strip_prefix("bt://") {
            let (addr, port) = parse_bt(rest)?;
            Ok(LinkUrl::Bt { addr, port })
        } else {
            Err(CoreError::InvalidUrl)
        }
    }
}

impl fmt::Display for LinkUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkUrl::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            LinkUrl::Udp { host, port } => write!(f, "udp://{host}:{port}"),
            LinkUrl::Bt { addr, port } => {
                write!(
                    f,
                    "bt://{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X};{}",
                    addr[0], addr[1], addr[2], addr[3], addr[4], addr[5], port
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_and_udp_urls_parse() {
        assert_eq!(
            "tcp://10.0.0.1:8000".parse::<LinkUrl>(),
            Ok(LinkUrl::Tcp { host: "10.0.0.1".to_string(), port: 8000 })
        );
        assert_eq!(
            "udp://localhost:9000".parse::<LinkUrl>(),
            Ok(LinkUrl::Udp { host: "localhost".to_string(), port: 9000 })
        );
    }

    #[test]
    fn bluetooth_url_parses_and_prints() {
        let url = "bt://00:11:22:AA:BB:CC;5".parse::<LinkUrl>().expect("parse");
        assert_eq!(url, LinkUrl::Bt { addr: [0x00, 0x11, 0x22, 0xaa, 0xbb, 0xcc], port: 5 });
        assert_eq!(url.to_string(), "bt://00:11:22:AA:BB:CC;5");
    }

    #[test]
    fn malformed_urls_fail_with_invalid_url() {
        for bad in
            ["example.org:80", "tcp://", "tcp://host", "tcp://host:notaport", "bt://00:11;1", ""]
        {
            assert_eq!(bad.parse::<LinkUrl>(), Err(CoreError::InvalidUrl), "url: {bad}");
        }
    }
}
