//! SOCKS5 client (RFC 1928, CONNECT with domain addressing, no auth)
//!
//! Tor resolves `.onion` names itself, so the hostname is always sent as
//! ATYP 0x03 and never resolved locally.

use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Error, Debug)]
pub enum SocksError {
    #[error("Cannot reach SOCKS proxy {addr}: {source}")]
    Proxy {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SOCKS proxy refused: {0}")]
    Refused(&'static str),

    #[error("SOCKS protocol error: {0}")]
    Protocol(String),

    #[error("Hostname too long for SOCKS5: {0} bytes")]
    HostTooLong(usize),

    #[error("SOCKS handshake timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SocksError>;

/// Text for a SOCKS5 reply code
pub fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown failure",
    }
}

/// Open a TCP connection to `host:port` through the proxy at `proxy_addr`.
///
/// Only the handshake is bounded by `handshake_timeout`.
pub async fn connect(
    proxy_addr: &str,
    host: &str,
    port: u16,
    handshake_timeout: Duration,
) -> Result<TcpStream> {
    if host.len() > u8::MAX as usize {
        return Err(SocksError::HostTooLong(host.len()));
    }

    timeout(handshake_timeout, async {
        let mut stream = TcpStream::connect(proxy_addr)
            .await
            .map_err(|source| SocksError::Proxy {
                addr: proxy_addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true).ok();
        handshake(&mut stream, host, port).await?;
        debug!(proxy = %proxy_addr, host = %host, port, "SOCKS5 connection established");
        Ok(stream)
    })
    .await
    .map_err(|_| SocksError::Timeout)?
}

async fn handshake(stream: &mut TcpStream, host: &str, port: u16) -> Result<()> {
    stream
        .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
        .await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(SocksError::Protocol(format!(
            "unexpected version {} in method reply",
            choice[0]
        )));
    }
    match choice[1] {
        METHOD_NO_AUTH => {}
        METHOD_NONE_ACCEPTABLE => return Err(SocksError::Refused("no acceptable auth method")),
        other => {
            return Err(SocksError::Protocol(format!(
                "proxy selected unsupported method {}",
                other
            )))
        }
    }

    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
    request.push(host.len() as u8);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    // VER | REP | RSV | ATYP
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(SocksError::Protocol(format!(
            "unexpected version {} in connect reply",
            reply[0]
        )));
    }
    if reply[1] != 0x00 {
        return Err(SocksError::Refused(reply_message(reply[1])));
    }

    // Drain BND.ADDR and BND.PORT
    let addr_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(SocksError::Protocol(format!(
                "unknown bound address type {}",
                other
            )))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}
