//! Trojan protocol codec
//!
//! Handshake on the post-TLS stream:
//! - 56-byte credential (SHA224 hex encoded)
//! - CRLF
//! - Command (1 byte: CONNECT=1, UDP_ASSOCIATE=3)
//! - Address (ATYP + address + port)
//! - CRLF
//! - Payload
//!
//! Once UDP_ASSOCIATE is negotiated the rest of the stream is a sequence of
//! `Address | Length(2) | CRLF | Payload` frames.
//!
//! Decoding pulls exactly one field at a time from the stream, so nothing past
//! the field being decoded is ever consumed.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::lookup_host;

use crate::error::{Error, Result};
use crate::utils::HEX_SHA224_LEN;

/// Address type constants
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

pub const CRLF: [u8; 2] = *b"\r\n";

/// Trojan command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// TCP connect
    Connect,
    /// UDP associate
    UdpAssociate,
    /// Any other byte; a protocol violation from an authenticated client
    Unknown(u8),
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            1 => Command::Connect,
            3 => Command::UdpAssociate,
            other => Command::Unknown(other),
        }
    }
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> u8 {
        match cmd {
            Command::Connect => 1,
            Command::UdpAssociate => 3,
            Command::Unknown(b) => b,
        }
    }
}

/// Address types supported by Trojan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address
    IPv4([u8; 4], u16),
    /// IPv6 address
    IPv6([u8; 16], u16),
    /// Domain name
    Domain(String, u16),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::IPv4(ip, port) => write!(f, "{}:{}", Ipv4Addr::from(*ip), port),
            Address::IPv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Address::IPv4(ip.octets(), addr.port()),
            // Sockets bound to [::] report IPv4 peers as mapped addresses
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(v4) => Address::IPv4(v4.octets(), addr.port()),
                None => Address::IPv6(ip.octets(), addr.port()),
            },
        }
    }
}

impl Address {
    /// Read one address from a stream, field by field.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut atyp = [0u8; 1];
        read_field(reader, &mut atyp, "address type").await?;
        Self::read_body(atyp[0], reader).await
    }

    /// Read the part of an address that follows its type tag.
    async fn read_body<R>(atyp: u8, reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        match atyp {
            ATYP_IPV4 => {
                let mut ip = [0u8; 4];
                read_field(reader, &mut ip, "IPv4 address").await?;
                Ok(Address::IPv4(ip, read_port(reader).await?))
            }
            ATYP_IPV6 => {
                let mut ip = [0u8; 16];
                read_field(reader, &mut ip, "IPv6 address").await?;
                Ok(Address::IPv6(ip, read_port(reader).await?))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                read_field(reader, &mut len, "domain length").await?;
                let mut domain = vec![0u8; len[0] as usize];
                read_field(reader, &mut domain, "domain").await?;
                let domain = String::from_utf8(domain)
                    .map_err(|_| Error::framing("invalid domain encoding"))?;
                Ok(Address::Domain(domain, read_port(reader).await?))
            }
            other => Err(Error::framing(format!("invalid address type {:#04x}", other))),
        }
    }

    /// Encode address to buffer
    /// Returns the number of bytes written
    pub fn encode(&self, buf: &mut impl BufMut) -> Result<usize> {
        match self {
            Address::IPv4(ip, port) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(ip);
                buf.put_u16(*port);
                Ok(7)
            }
            Address::IPv6(ip, port) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(ip);
                buf.put_u16(*port);
                Ok(19)
            }
            Address::Domain(domain, port) => {
                let len = u8::try_from(domain.len())
                    .map_err(|_| Error::framing("domain longer than 255 bytes"))?;
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(len);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
                Ok(4 + domain.len())
            }
        }
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        match self {
            Address::IPv4(_, port) => *port,
            Address::IPv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Resolve to socket address
    pub async fn to_socket_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Address::IPv4(ip, port) => Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(*ip)), *port)),
            Address::IPv6(ip, port) => Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(*ip)), *port)),
            Address::Domain(domain, port) => {
                let mut addrs = lookup_host((domain.as_str(), *port)).await?;
                addrs.next().ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no addresses found for {}", domain),
                    )
                })
            }
        }
    }
}

/// Fill `buf` completely or fail with a framing error naming the field.
async fn read_field<R>(reader: &mut R, buf: &mut [u8], field: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(Error::framing(format!("truncated {}", field)))
        }
        Err(e) => Err(e.into()),
    }
}

async fn read_port<R>(reader: &mut R) -> Result<u16>
where
    R: AsyncRead + Unpin,
{
    let mut port = [0u8; 2];
    read_field(reader, &mut port, "port").await?;
    Ok(u16::from_be_bytes(port))
}

async fn read_crlf<R>(reader: &mut R, after: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut crlf = [0u8; 2];
    read_field(reader, &mut crlf, "CRLF").await?;
    if crlf != CRLF {
        return Err(Error::framing(format!("missing CRLF after {}", after)));
    }
    Ok(())
}

/// Read the 56-byte credential that opens every handshake.
pub async fn read_credential<R>(reader: &mut R) -> Result<[u8; HEX_SHA224_LEN]>
where
    R: AsyncRead + Unpin,
{
    let mut credential = [0u8; HEX_SHA224_LEN];
    read_field(reader, &mut credential, "credential").await?;
    Ok(credential)
}

/// The part of a handshake that follows the credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub addr: Address,
}

impl Request {
    /// Read `CRLF | command | address | CRLF` in order.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        read_crlf(reader, "credential").await?;
        let mut cmd = [0u8; 1];
        read_field(reader, &mut cmd, "command").await?;
        let addr = Address::read_from(reader).await?;
        read_crlf(reader, "address").await?;
        Ok(Request {
            command: Command::from(cmd[0]),
            addr,
        })
    }

    /// Encode a full handshake header, credential included.
    pub fn encode(&self, credential: &[u8; HEX_SHA224_LEN], buf: &mut impl BufMut) -> Result<()> {
        buf.put_slice(credential);
        buf.put_slice(&CRLF);
        buf.put_u8(self.command.into());
        self.addr.encode(buf)?;
        buf.put_slice(&CRLF);
        Ok(())
    }
}

/// Trojan UDP packet format (within the tunnel stream)
///
/// Format: ATYP(1) + DST.ADDR(variable) + DST.PORT(2) + Length(2) + CRLF(2) + Payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    /// Target (client to server) or source (server to client) address
    pub addr: Address,
    /// Payload data
    pub payload: Bytes,
}

impl UdpPacket {
    /// Read one whole frame from a stream.
    ///
    /// Returns `Ok(None)` on a clean end of stream between frames; an end of
    /// stream inside a frame is a framing error.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Self>>
    where
        R: AsyncRead + Unpin,
    {
        let mut atyp = [0u8; 1];
        if reader.read(&mut atyp).await? == 0 {
            return Ok(None);
        }
        let addr = Address::read_body(atyp[0], reader).await?;

        let mut len = [0u8; 2];
        read_field(reader, &mut len, "UDP payload length").await?;
        read_crlf(reader, "UDP payload length").await?;

        let mut payload = BytesMut::zeroed(u16::from_be_bytes(len) as usize);
        read_field(reader, &mut payload, "UDP payload").await?;

        Ok(Some(UdpPacket {
            addr,
            payload: payload.freeze(),
        }))
    }

    /// Encode UDP packet to buffer
    pub fn encode(addr: &Address, payload: &[u8], buf: &mut impl BufMut) -> Result<()> {
        let len = u16::try_from(payload.len())
            .map_err(|_| Error::framing("UDP payload longer than 65535 bytes"))?;
        addr.encode(buf)?;
        buf.put_u16(len);
        buf.put_slice(&CRLF);
        buf.put_slice(payload);
        Ok(())
    }
}
