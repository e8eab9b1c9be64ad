mod handshake;
mod relay;
mod router;
mod server;
mod socks5;

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use anyhow::anyhow;
use compact_str::CompactString;
use tokio::net::{TcpStream, ToSocketAddrs};

pub use router::Router;
pub use server::Server;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

type Bytes = smallvec::SmallVec<[u8; 32]>;

/// A destination as it appears on the wire. Domain names keep the raw bytes
/// the client sent so they can be forwarded to the backend untouched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    IPv4([u8; 4]),
    IPv6([u8; 16]),
    Domain(Bytes),
}

impl Address {
    pub fn atyp(&self) -> u8 {
        match self {
            Address::IPv4(_) => ATYP_IPV4,
            Address::Domain(_) => ATYP_DOMAIN,
            Address::IPv6(_) => ATYP_IPV6,
        }
    }

    /// Appends the layout that follows the address type tag: 4 bytes,
    /// a length byte and the name, or 16 bytes.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Address::IPv4(ip) => out.extend_from_slice(ip),
            Address::IPv6(ip) => out.extend_from_slice(ip),
            Address::Domain(d) => {
                out.push(d.len() as u8);
                out.extend_from_slice(d);
            }
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::IPv4(ip) => Some(Ipv4Addr::from(*ip).into()),
            Address::IPv6(ip) => Some(Ipv6Addr::from(*ip).into()),
            Address::Domain(_) => None,
        }
    }

    pub fn host(&self) -> CompactString {
        match self {
            Address::Domain(d) => CompactString::from_utf8_lossy(d),
            _ => match self.ip() {
                Some(ip) => compact_str::format_compact!("{ip}"),
                None => CompactString::default(),
            },
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::IPv4(v4.octets()),
            IpAddr::V6(v6) => Address::IPv6(v6.octets()),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::IPv6(_) => write!(f, "[{}]", self.host()),
            _ => f.write_str(&self.host()),
        }
    }
}

pub fn encode_port(port: u16) -> [u8; 2] {
    port.to_be_bytes()
}

pub fn decode_port(raw: [u8; 2]) -> u16 {
    u16::from_be_bytes(raw)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub handshake: Duration,
    pub connect: Duration,
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            handshake: Duration::from_secs(30),
            connect: Duration::from_secs(10),
            idle: Duration::from_secs(300),
        }
    }
}

async fn timed<T>(
    limit: Duration,
    what: &'static str,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| anyhow!("{what} timed out after {limit:?}"))?
}

async fn connect_to_upstream(
    addr: impl ToSocketAddrs,
    limit: Duration,
) -> anyhow::Result<TcpStream> {
    let stream = timed(limit, "connect", async {
        TcpStream::connect(addr)
            .await
            .map_err(|e| anyhow!("failed to connect to upstream: {}", e.to_string()))
    })
    .await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::SmallVec;

    #[test]
    fn port_codec() {
        assert_eq!(encode_port(0), [0, 0]);
        assert_eq!(encode_port(80), [0, 80]);
        assert_eq!(encode_port(443), [1, 187]);
        assert_eq!(encode_port(65535), [255, 255]);
        for port in [1u16, 255, 256, 8388, 40000] {
            assert_eq!(decode_port(encode_port(port)), port);
        }
        assert_eq!(decode_port([0x1f, 0x90]), 8080);
    }

    #[test]
    fn address_layouts() {
        let mut out = Vec::new();
        Address::IPv4([8, 8, 4, 4]).write_to(&mut out);
        assert_eq!(out, [8, 8, 4, 4]);

        out.clear();
        Address::Domain(SmallVec::from_slice(b"example.com")).write_to(&mut out);
        assert_eq!(out[0], 11);
        assert_eq!(&out[1..], b"example.com");

        out.clear();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        Address::from(v6).write_to(&mut out);
        assert_eq!(out.len(), 16);
        assert_eq!(Address::from(v6).atyp(), ATYP_IPV6);
    }

    #[test]
    fn address_display() {
        assert_eq!(Address::IPv4([1, 2, 3, 4]).to_string(), "1.2.3.4");
        assert_eq!(
            Address::from("::1".parse::<IpAddr>().unwrap()).to_string(),
            "[::1]"
        );
        assert_eq!(
            Address::Domain(SmallVec::from_slice(b"a.b")).to_string(),
            "a.b"
        );
    }
}
