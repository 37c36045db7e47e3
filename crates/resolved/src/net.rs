//! Byte-level framing for sending and receiving DNS messages over UDP
//! and TCP, and a small client for querying a remote nameserver.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use dns_types::protocol::types::*;

/// Read a DNS message from a TCP stream.
///
/// A DNS TCP message has a big-endian u16 length prefix ahead of the
/// wire-format message, so the whole thing can be read before
/// parsing begins.
pub async fn read_tcp_bytes(stream: &mut TcpStream) -> Result<BytesMut, TcpError> {
    let size = stream.read_u16().await.map_err(|error| TcpError::IO { id: None, error })?;
    let expected = size as usize;
    let mut bytes = BytesMut::with_capacity(expected);
    while bytes.len() < expected {
        match stream.read_buf(&mut bytes).await {
            Ok(0) => {
                let id = packet_id(&bytes);
                return Err(TcpError::TooShort {
                    id,
                    expected,
                    actual: bytes.len(),
                });
            }
            Ok(_) => {}
            Err(error) => {
                let id = packet_id(&bytes);
                return Err(TcpError::IO { id, error });
            }
        }
    }
    Ok(bytes)
}

fn packet_id(bytes: &[u8]) -> Option<u16> {
    if bytes.len() >= 2 {
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    } else {
        None
    }
}

#[derive(Debug)]
pub enum TcpError {
    TooShort { id: Option<u16>, expected: usize, actual: usize },
    IO { id: Option<u16>, error: io::Error },
}

/// Write a serialised message to a UDP socket already connected to
/// its peer, truncating and setting TC if it is too big for a single
/// datagram.
pub async fn send_udp_bytes(sock: &UdpSocket, bytes: &mut [u8]) -> io::Result<()> {
    if bytes.len() > 512 {
        bytes[2] |= 0b0000_0010;
        sock.send(&bytes[..512]).await?;
    } else {
        bytes[2] &= 0b1111_1101;
        sock.send(bytes).await?;
    }
    Ok(())
}

/// Like `send_udp_bytes` but for an unconnected socket with an
/// explicit destination.
pub async fn send_udp_bytes_to(sock: &UdpSocket, target: SocketAddr, bytes: &mut [u8]) -> io::Result<()> {
    if bytes.len() > 512 {
        bytes[2] |= 0b0000_0010;
        sock.send_to(&bytes[..512], target).await?;
    } else {
        bytes[2] &= 0b1111_1101;
        sock.send_to(bytes, target).await?;
    }
    Ok(())
}

/// Write a serialised message to a TCP stream with its length prefix.
pub async fn send_tcp_bytes(stream: &mut TcpStream, bytes: &mut [u8]) -> io::Result<()> {
    let len = if let Ok(len) = u16::try_from(bytes.len()) {
        bytes[2] &= 0b1111_1101;
        len
    } else {
        bytes[2] |= 0b0000_0010;
        u16::MAX
    };

    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&bytes[..(len as usize)]).await?;
    Ok(())
}

/// Send a message to a remote nameserver, preferring UDP and falling
/// back to TCP if the reply is truncated. Each transport attempt has
/// a 5s timeout.
pub async fn query_nameserver(address: SocketAddr, msg: &Message) -> Option<Message> {
    let mut serialised = msg.to_octets().ok()?;

    if let Some(response) = query_nameserver_udp(address, &mut serialised).await {
        if response_matches_request(msg, &response) {
            return Some(response);
        }
    }

    if let Some(response) = query_nameserver_tcp(address, &mut serialised).await {
        if response_matches_request(msg, &response) {
            return Some(response);
        }
    }

    None
}

async fn query_nameserver_udp(address: SocketAddr, serialised: &mut [u8]) -> Option<Message> {
    timeout(Duration::from_secs(5), query_nameserver_udp_notimeout(address, serialised))
        .await
        .ok()
        .flatten()
}

async fn query_nameserver_udp_notimeout(address: SocketAddr, serialised: &mut [u8]) -> Option<Message> {
    if serialised.len() > 512 {
        return None;
    }
    let mut buf = vec![0u8; 512];
    let sock = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    sock.connect(address).await.ok()?;
    send_udp_bytes(&sock, serialised).await.ok()?;
    let size = sock.recv(&mut buf).await.ok()?;
    Message::from_octets(&buf[..size]).ok()
}

async fn query_nameserver_tcp(address: SocketAddr, serialised: &mut [u8]) -> Option<Message> {
    timeout(Duration::from_secs(5), query_nameserver_tcp_notimeout(address, serialised))
        .await
        .ok()
        .flatten()
}

async fn query_nameserver_tcp_notimeout(address: SocketAddr, serialised: &mut [u8]) -> Option<Message> {
    let mut stream = TcpStream::connect(address).await.ok()?;
    send_tcp_bytes(&mut stream, serialised).await.ok()?;
    let bytes = read_tcp_bytes(&mut stream).await.ok()?;
    Message::from_octets(bytes.as_ref()).ok()
}

/// Basic sanity check that `response` actually answers `request`.
fn response_matches_request(request: &Message, response: &Message) -> bool {
    request.header.id == response.header.id
        && response.header.is_response
        && request.header.opcode == response.header.opcode
        && !response.header.is_truncated
        && request.questions == response.questions
}
