use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::proxy::handshake::Request;
use crate::proxy::*;

const SOCKS5: u8 = 0x05;
const COMMAND_CONNECT: u8 = 0x01;
const RESERVED: u8 = 0x00;

#[repr(u8)]
enum AuthMethod {
    None = 0x00,
}

#[repr(u8)]
enum Status {
    Granted = 0x00,
}

/// Negotiates a CONNECT for `request` with a SOCKS5 backend, without
/// authentication. Returns the address the backend reports as bound.
pub async fn handle(
    backend: &mut (impl AsyncRead + AsyncWrite + Unpin),
    request: &Request,
) -> anyhow::Result<(Address, u16)> {
    negotiate_auth(backend).await?;
    write_request(backend, request).await?;
    read_response(backend).await
}

async fn negotiate_auth(backend: &mut (impl AsyncRead + AsyncWrite + Unpin)) -> anyhow::Result<()> {
    backend
        .write_all(&[SOCKS5, 1, AuthMethod::None as u8])
        .await?;

    let mut choice = [0u8; 2];
    backend.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5 {
        return Err(ProtocolError::SocksVersion(choice[0]).into());
    }
    if choice[1] != AuthMethod::None as u8 {
        return Err(ProtocolError::AuthMethod(choice[1]).into());
    }
    Ok(())
}

async fn write_request(
    writer: &mut (impl AsyncWrite + Unpin),
    request: &Request,
) -> anyhow::Result<()> {
    let mut buf = Vec::with_capacity(4 + 1 + 255 + 2);
    buf.extend_from_slice(&[
        SOCKS5,
        COMMAND_CONNECT,
        RESERVED,
        request.address.atyp(),
    ]);
    request.address.write_to(&mut buf);
    buf.extend_from_slice(&encode_port(request.port));
    writer.write_all(&buf).await?;
    Ok(())
}

async fn read_response(reader: &mut (impl AsyncRead + Unpin)) -> anyhow::Result<(Address, u16)> {
    // version, status, reserved, address type
    let mut head = [0u8; 4];
    reader.read_exact(&mut head).await?;
    if head[1] != Status::Granted as u8 {
        return Err(ProtocolError::Rejected(head[1]).into());
    }
    let address = match head[3] {
        ATYP_IPV4 => {
            let mut ipv4_buf = [0u8; 4];
            reader.read_exact(&mut ipv4_buf).await?;
            Address::IPv4(ipv4_buf)
        }
        ATYP_IPV6 => {
            let mut ipv6_buf = [0u8; 16];
            reader.read_exact(&mut ipv6_buf).await?;
            Address::IPv6(ipv6_buf)
        }
        ATYP_DOMAIN => {
            let len = reader.read_u8().await?;
            let mut buf: Bytes = smallvec::smallvec![0u8; len as usize];
            reader.read_exact(&mut buf).await?;
            Address::Domain(buf)
        }
        x => return Err(ProtocolError::UnknownBindAddressType(x).into()),
    };
    let port = reader.read_u16().await?;
    Ok((address, port))
}
