use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::buffer::Buffer;
use crate::crypto::{Cipher, CipherMode};
use crate::error::ProtocolError;
use crate::proxy::*;

/// The destination a client asked for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub address: Address,
    pub port: u16,
}

/// Decodes `[iv][enc(atyp)][enc(address)][enc(port)]` from the client.
///
/// Bytes are accumulated in `buf`. On success the header has been consumed
/// from it, and whatever the client sent after the header is left at the
/// front of `buf`, still encrypted, ready for the returned read cipher.
pub async fn read_request(
    reader: &mut (impl AsyncRead + Unpin),
    buf: &mut Buffer,
    mode: CipherMode,
    key: &[u8],
) -> anyhow::Result<(Request, Cipher)> {
    let iv_len = mode.iv_len();
    fill_to(reader, buf, iv_len + 1).await?;
    let mut cipher = Cipher::decryptor(mode, key, &buf.filled()[..iv_len])?;

    let atyp = open(&mut cipher, buf, iv_len, 1)?[0];
    let body = iv_len + 1;
    let (address, port_at) = match atyp {
        ATYP_IPV4 => {
            fill_to(reader, buf, body + 4 + 2).await?;
            let mut ip = [0u8; 4];
            ip.copy_from_slice(open(&mut cipher, buf, body, 4)?);
            (Address::IPv4(ip), body + 4)
        }
        ATYP_DOMAIN => {
            fill_to(reader, buf, body + 1).await?;
            let len = open(&mut cipher, buf, body, 1)?[0] as usize;
            if len == 0 {
                return Err(ProtocolError::EmptyDomain.into());
            }
            fill_to(reader, buf, body + 1 + len + 2).await?;
            let name = open(&mut cipher, buf, body + 1, len)?;
            (Address::Domain(Bytes::from_slice(name)), body + 1 + len)
        }
        ATYP_IPV6 => {
            fill_to(reader, buf, body + 16 + 2).await?;
            let mut ip = [0u8; 16];
            ip.copy_from_slice(open(&mut cipher, buf, body, 16)?);
            (Address::IPv6(ip), body + 16)
        }
        x => return Err(ProtocolError::UnknownAddressType(x).into()),
    };
    let raw_port = open(&mut cipher, buf, port_at, 2)?;
    let port = decode_port([raw_port[0], raw_port[1]]);

    buf.consume(port_at + 2);
    Ok((Request { address, port }, cipher))
}

/// Reads until `buf` holds at least `n` bytes.
async fn fill_to(
    reader: &mut (impl AsyncRead + Unpin),
    buf: &mut Buffer,
    n: usize,
) -> anyhow::Result<()> {
    if buf.len() < n {
        buf.reserve(n - buf.len());
    }
    while buf.len() < n {
        let read = reader.read(buf.unfilled_mut()).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                format!("client closed after {} of {} header bytes", buf.len(), n),
            )
            .into());
        }
        buf.advance(read);
    }
    Ok(())
}

/// Decrypts `buf[at..at + len]` in place and returns it.
fn open<'a>(
    cipher: &mut Cipher,
    buf: &'a mut Buffer,
    at: usize,
    len: usize,
) -> anyhow::Result<&'a [u8]> {
    let region = &mut buf.filled_mut()[at..at + len];
    cipher.decrypt_in_place(region)?;
    Ok(region)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;

    const MODE: CipherMode = CipherMode::Aes256Ctr;

    /// `iv ++ enc(plain)` the way a client would send it.
    fn envelope(key: &[u8], plain: &[u8]) -> Vec<u8> {
        let mut c = Cipher::encryptor(MODE, key).unwrap();
        let mut out = c.iv().to_vec();
        out.extend_from_slice(&c.encrypt(plain).unwrap());
        out
    }

    async fn decode(
        wire: Vec<u8>,
        chunk: usize,
    ) -> (anyhow::Result<(Request, Cipher)>, Buffer) {
        let key = MODE.derive_key("holo");
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            for piece in wire.chunks(chunk) {
                if client.write_all(piece).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });
        let mut buf = Buffer::with_capacity(1024);
        let result = read_request(&mut server, &mut buf, MODE, &key).await;
        (result, buf)
    }

    #[tokio::test]
    async fn ipv4_with_trailing_payload() {
        let key = MODE.derive_key("holo");
        let mut plain = vec![ATYP_IPV4, 1, 2, 3, 4, 0x01, 0xbb];
        plain.extend_from_slice(b"GET / HTTP/1.1\r\n");
        let (result, mut buf) = decode(envelope(&key, &plain), 5).await;
        let (req, mut cipher) = result.unwrap();
        assert_eq!(req.address, Address::IPv4([1, 2, 3, 4]));
        assert_eq!(req.port, 443);

        // the wire was written in small pieces, so the trailing bytes may be partial
        let pending = buf.len();
        assert!(pending <= 16);
        cipher.decrypt_in_place(buf.filled_mut()).unwrap();
        assert_eq!(buf.filled(), &b"GET / HTTP/1.1\r\n"[..pending]);
    }

    #[tokio::test]
    async fn payload_in_the_same_write_is_kept() {
        let key = MODE.derive_key("holo");
        let mut plain = vec![ATYP_IPV4, 10, 0, 0, 1, 0, 80];
        plain.extend_from_slice(b"hello");
        let (result, mut buf) = decode(envelope(&key, &plain), 4096).await;
        let (_, mut cipher) = result.unwrap();
        assert_eq!(buf.len(), 5);
        cipher.decrypt_in_place(buf.filled_mut()).unwrap();
        assert_eq!(buf.filled(), b"hello");
    }

    #[tokio::test]
    async fn longest_domain() {
        let key = MODE.derive_key("holo");
        let name = vec![b'a'; 255];
        let mut plain = vec![ATYP_DOMAIN, 255];
        plain.extend_from_slice(&name);
        plain.extend_from_slice(&encode_port(8080));
        let (result, buf) = decode(envelope(&key, &plain), 7).await;
        let (req, _) = result.unwrap();
        assert_eq!(req.address, Address::Domain(Bytes::from_slice(&name)));
        assert_eq!(req.port, 8080);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn shortest_domain() {
        let key = MODE.derive_key("holo");
        let plain = [ATYP_DOMAIN, 1, b'x', 0, 53];
        let (result, _) = decode(envelope(&key, &plain), 1).await;
        let (req, _) = result.unwrap();
        assert_eq!(req.address, Address::Domain(Bytes::from_slice(b"x")));
        assert_eq!(req.port, 53);
    }

    #[tokio::test]
    async fn empty_domain_is_rejected() {
        let key = MODE.derive_key("holo");
        let plain = [ATYP_DOMAIN, 0, 0, 80];
        let (result, _) = decode(envelope(&key, &plain), 64).await;
        let err = result.err().unwrap();
        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::EmptyDomain)
        );
    }

    #[tokio::test]
    async fn ipv6() {
        let key = MODE.derive_key("holo");
        let ip: std::net::Ipv6Addr = "2001:db8::ff".parse().unwrap();
        let mut plain = vec![ATYP_IPV6];
        plain.extend_from_slice(&ip.octets());
        plain.extend_from_slice(&encode_port(65535));
        let (result, _) = decode(envelope(&key, &plain), 3).await;
        let (req, _) = result.unwrap();
        assert_eq!(req.address, Address::IPv6(ip.octets()));
        assert_eq!(req.port, 65535);
    }

    #[tokio::test]
    async fn unknown_address_types() {
        let key = MODE.derive_key("holo");
        for atyp in [0u8, 2, 5, 0xff] {
            let plain = [atyp, 1, 2, 3, 4, 0, 80];
            let (result, _) = decode(envelope(&key, &plain), 64).await;
            let err = result.err().unwrap();
            assert_eq!(
                err.downcast_ref::<ProtocolError>(),
                Some(&ProtocolError::UnknownAddressType(atyp))
            );
        }
    }

    #[tokio::test]
    async fn truncated_header() {
        let key = MODE.derive_key("holo");
        let mut wire = envelope(&key, &[ATYP_IPV4, 1, 2, 3, 4, 0, 80]);
        wire.truncate(20);
        let (result, _) = decode(wire, 64).await;
        let err = result.err().unwrap();
        let io = err.downcast_ref::<io::Error>().unwrap();
        assert_eq!(io.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn wrong_password_never_panics() {
        let key = MODE.derive_key("another");
        let wire = envelope(&key, &[ATYP_IPV4, 1, 2, 3, 4, 0, 80]);
        // decoding with "holo" yields garbage: either an error or some address
        let _ = decode(wire, 64).await;
    }
}
