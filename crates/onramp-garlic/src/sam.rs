//! SAM (Simple Anonymous Messaging) v3 client
//!
//! Thin async client for the commands a Garlic session needs. Every
//! `SESSION CREATE`, `STREAM CONNECT` and `STREAM ACCEPT` runs on its own
//! bridge connection; the bridge ties a session's lifetime to the socket
//! that created it.

use crate::keys::I2pKeys;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum SamError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("SAM protocol error: {0}")]
    ProtocolError(String),

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Session error: {0}")]
    SessionError(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SamError>;

/// Lowest SAM version the client speaks
const SAM_MIN_VERSION: &str = "3.1";
/// Highest SAM version the client speaks
const SAM_MAX_VERSION: &str = "3.3";

/// Bridge connection after `STREAM CONNECT`/`STREAM ACCEPT`: a plain byte pipe
pub type SamStream = BufReader<TcpStream>;

/// SAM session types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStyle {
    /// Stream-based connections (TCP-like)
    Stream,
    /// Repliable datagrams (UDP-like)
    Datagram,
}

impl SessionStyle {
    fn as_str(&self) -> &str {
        match self {
            SessionStyle::Stream => "STREAM",
            SessionStyle::Datagram => "DATAGRAM",
        }
    }
}

/// One HELLO-negotiated connection to the SAM bridge
pub struct SamConnection {
    stream: BufReader<TcpStream>,
    timeout: Duration,
    version: String,
}

impl SamConnection {
    /// Connect to the bridge and negotiate a protocol version
    pub async fn connect(sam_addr: &str, control_timeout: Duration) -> Result<Self> {
        let stream = timeout(control_timeout, TcpStream::connect(sam_addr))
            .await
            .map_err(|_| SamError::Timeout("SAM bridge connection"))?
            .map_err(|e| SamError::ConnectionFailed(format!("{}: {}", sam_addr, e)))?;
        stream.set_nodelay(true).ok();

        let mut connection = SamConnection {
            stream: BufReader::new(stream),
            timeout: control_timeout,
            version: String::new(),
        };

        let response = connection
            .command(&format!(
                "HELLO VERSION MIN={} MAX={}\n",
                SAM_MIN_VERSION, SAM_MAX_VERSION
            ))
            .await?;
        if !response.starts_with("HELLO REPLY") || !is_ok(&response) {
            return Err(SamError::ProtocolError(format!(
                "HELLO failed: {}",
                response
            )));
        }
        connection.version =
            extract_value(&response, "VERSION=").unwrap_or_else(|| SAM_MIN_VERSION.to_string());
        debug!(sam = %sam_addr, version = %connection.version, "SAM handshake complete");

        Ok(connection)
    }

    /// Protocol version the bridge agreed to
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Generate a new destination
    pub async fn generate_destination(&mut self, signature_type: u8) -> Result<I2pKeys> {
        let response = self
            .command(&format!("DEST GENERATE SIGNATURE_TYPE={}\n", signature_type))
            .await?;

        // Format: DEST REPLY PUB=<destination> PRIV=<private_keys>
        if !response.starts_with("DEST REPLY") {
            return Err(SamError::ProtocolError(format!(
                "DEST GENERATE failed: {}",
                response
            )));
        }
        let public = extract_value(&response, "PUB=")
            .ok_or_else(|| SamError::ProtocolError("No destination in response".to_string()))?;
        let private = extract_value(&response, "PRIV=")
            .ok_or_else(|| SamError::ProtocolError("No private key in response".to_string()))?;

        Ok(I2pKeys::new(public, private))
    }

    /// Create a session bound to this connection. `params` are appended
    /// verbatim (tunnel options, `PORT=`/`HOST=` for datagrams).
    pub async fn create_session(
        &mut self,
        session_id: &str,
        style: SessionStyle,
        destination: &str,
        params: &[String],
    ) -> Result<String> {
        let mut cmd = format!(
            "SESSION CREATE STYLE={} ID={} DESTINATION={}",
            style.as_str(),
            session_id,
            destination
        );
        for param in params {
            cmd.push(' ');
            cmd.push_str(param);
        }
        cmd.push('\n');

        let response = self.command(&cmd).await?;
        if !response.starts_with("SESSION STATUS") || !is_ok(&response) {
            return Err(SamError::SessionError(format!(
                "Session creation failed: {}",
                failure_reason(&response)
            )));
        }

        extract_value(&response, "DESTINATION=")
            .ok_or_else(|| SamError::ProtocolError("No destination in response".to_string()))
    }

    /// Resolve a hostname (`foo.i2p`, `<hash>.b32.i2p`) to a full destination
    pub async fn naming_lookup(&mut self, name: &str) -> Result<String> {
        let response = self
            .command(&format!("NAMING LOOKUP NAME={}\n", name))
            .await?;
        if !response.starts_with("NAMING REPLY") {
            return Err(SamError::ProtocolError(format!(
                "NAMING LOOKUP failed: {}",
                response
            )));
        }
        if !is_ok(&response) {
            return Err(SamError::InvalidDestination(format!(
                "{}: {}",
                name,
                failure_reason(&response)
            )));
        }

        extract_value(&response, "VALUE=")
            .ok_or_else(|| SamError::ProtocolError("No value in naming reply".to_string()))
    }

    /// Connect to a remote destination, turning this connection into the data stream
    pub async fn stream_connect(mut self, session_id: &str, destination: &str) -> Result<SamStream> {
        let response = self
            .command(&format!(
                "STREAM CONNECT ID={} DESTINATION={} SILENT=false\n",
                session_id, destination
            ))
            .await?;

        if !response.starts_with("STREAM STATUS") || !is_ok(&response) {
            return Err(SamError::ProtocolError(format!(
                "STREAM CONNECT failed: {}",
                failure_reason(&response)
            )));
        }

        Ok(self.stream)
    }

    /// Wait for one inbound stream. Returns the data stream and the peer's
    /// destination. Only the status reply is bounded by the control
    /// timeout; waiting for a peer is not.
    pub async fn stream_accept(mut self, session_id: &str) -> Result<(SamStream, String)> {
        let response = self
            .command(&format!("STREAM ACCEPT ID={} SILENT=false\n", session_id))
            .await?;

        if !response.starts_with("STREAM STATUS") || !is_ok(&response) {
            return Err(SamError::ProtocolError(format!(
                "STREAM ACCEPT failed: {}",
                failure_reason(&response)
            )));
        }

        // Peer line: "<destination>" or "<destination> FROM_PORT=n TO_PORT=n"
        let line = self.read_response().await?;
        let remote_dest = line
            .split_whitespace()
            .next()
            .ok_or_else(|| SamError::ProtocolError("No destination in accept".to_string()))?
            .to_string();

        Ok((self.stream, remote_dest))
    }

    /// Close the connection, ending any session bound to it
    pub async fn close(mut self) -> Result<()> {
        self.stream.get_mut().shutdown().await?;
        Ok(())
    }

    /// Send one command and read its single-line reply within the control timeout
    async fn command(&mut self, command: &str) -> Result<String> {
        let deadline = self.timeout;
        timeout(deadline, async {
            self.send_command(command).await?;
            self.read_response().await
        })
        .await
        .map_err(|_| SamError::Timeout("SAM reply"))?
    }

    async fn send_command(&mut self, command: &str) -> Result<()> {
        trace!(command = %redact(command), "SAM ->");
        let stream = self.stream.get_mut();
        stream.write_all(command.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = self.stream.read_line(&mut line).await?;
        if read == 0 {
            return Err(SamError::ConnectionFailed(
                "connection closed by SAM bridge".to_string(),
            ));
        }
        let line = line.trim().to_string();
        trace!(reply = %redact(&line), "SAM <-");
        Ok(line)
    }
}

/// Value of a `KEY=value` token. Quoted values may contain spaces.
pub(crate) fn extract_value(response: &str, key: &str) -> Option<String> {
    let mut search_from = 0;
    while let Some(found) = response[search_from..].find(key) {
        let start = search_from + found;
        search_from = start + key.len();

        // Only match at a token boundary
        if start > 0 && !response[..start].ends_with(' ') {
            continue;
        }

        let remaining = &response[start + key.len()..];
        if let Some(quoted) = remaining.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            return Some(quoted[..end].to_string());
        }
        let end = remaining.find(' ').unwrap_or(remaining.len());
        return Some(remaining[..end].to_string());
    }
    None
}

fn is_ok(response: &str) -> bool {
    extract_value(response, "RESULT=").as_deref() == Some("OK")
}

fn failure_reason(response: &str) -> String {
    match (
        extract_value(response, "RESULT="),
        extract_value(response, "MESSAGE="),
    ) {
        (Some(result), Some(message)) => format!("{} ({})", result, message),
        (Some(result), None) => result,
        _ => response.to_string(),
    }
}

/// Hide private key material in trace output
fn redact(line: &str) -> String {
    line.split(' ')
        .map(|token| {
            if token.starts_with("PRIV=") {
                "PRIV=<redacted>"
            } else if token.starts_with("DESTINATION=") && token.len() > 700 {
                "DESTINATION=<private>"
            } else {
                token
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
