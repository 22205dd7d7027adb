//! Tor control port client
//!
//! Covers the commands an onion session needs: PROTOCOLINFO,
//! AUTHENTICATE, ADD_ONION and DEL_ONION.

use crate::config::TorAuth;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum TorControlError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Tor replied {code}: {message}")]
    Rejected { code: u16, message: String },

    #[error("Control protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TorControlError>;

/// One complete control port reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    /// Text of every reply line, data blocks included, status code stripped
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.code == 250
    }

    /// Value of `key=` on any reply line
    pub fn value(&self, key: &str) -> Option<String> {
        let prefix = format!("{}=", key);
        self.lines.iter().find_map(|line| {
            line.split(' ')
                .find_map(|token| token.strip_prefix(&prefix))
                .map(|v| v.trim_matches('"').to_string())
        })
    }

    fn message(&self) -> String {
        self.lines.join("; ")
    }
}

/// Parsed PROTOCOLINFO reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub auth_methods: Vec<String>,
    pub cookie_file: Option<PathBuf>,
    pub tor_version: Option<String>,
}

impl ProtocolInfo {
    fn from_reply(reply: &Reply) -> Self {
        let mut info = ProtocolInfo::default();
        for line in &reply.lines {
            if let Some(rest) = line.strip_prefix("AUTH ") {
                if let Some(methods) = rest
                    .split(' ')
                    .find_map(|token| token.strip_prefix("METHODS="))
                {
                    info.auth_methods = methods.split(',').map(str::to_string).collect();
                }
                info.cookie_file = quoted_value(rest, "COOKIEFILE=").map(PathBuf::from);
            } else if let Some(rest) = line.strip_prefix("VERSION ") {
                info.tor_version = quoted_value(rest, "Tor=");
            }
        }
        info
    }

    pub fn supports(&self, method: &str) -> bool {
        self.auth_methods.iter().any(|m| m == method)
    }
}

/// Value of `key="..."`, honoring backslash escapes
fn quoted_value(text: &str, key: &str) -> Option<String> {
    let start = text.find(key)? + key.len();
    let rest = text[start..].strip_prefix('"')?;
    let mut value = String::new();
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => value.push(chars.next()?),
            '"' => return Some(value),
            c => value.push(c),
        }
    }
    None
}

fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Authenticated-or-not connection to the Tor control port
pub struct TorControl {
    stream: BufReader<TcpStream>,
    timeout: Duration,
}

impl TorControl {
    pub async fn connect(control_addr: &str, control_timeout: Duration) -> Result<Self> {
        let stream = timeout(control_timeout, TcpStream::connect(control_addr))
            .await
            .map_err(|_| TorControlError::Timeout("Tor control connection"))?
            .map_err(|e| TorControlError::ConnectionFailed(format!("{}: {}", control_addr, e)))?;

        debug!(addr = %control_addr, "Connected to Tor control port");
        Ok(TorControl {
            stream: BufReader::new(stream),
            timeout: control_timeout,
        })
    }

    /// Connect and authenticate in one step
    pub async fn open(control_addr: &str, auth: &TorAuth, control_timeout: Duration) -> Result<Self> {
        let mut control = Self::connect(control_addr, control_timeout).await?;
        control.authenticate(auth).await?;
        Ok(control)
    }

    pub async fn protocol_info(&mut self) -> Result<ProtocolInfo> {
        let reply = self.command("PROTOCOLINFO 1").await?;
        Ok(ProtocolInfo::from_reply(&reply))
    }

    pub async fn authenticate(&mut self, auth: &TorAuth) -> Result<()> {
        let info = self.protocol_info().await?;
        debug!(
            methods = ?info.auth_methods,
            version = ?info.tor_version,
            "Tor control protocol info"
        );

        let credential = match auth {
            TorAuth::Null => String::new(),
            TorAuth::Password { password } => quote(password),
            TorAuth::Cookie { path } => {
                let path = path
                    .clone()
                    .or_else(|| info.cookie_file.clone())
                    .ok_or_else(|| TorControlError::Auth("no cookie file known".to_string()))?;
                read_cookie(&path).await?
            }
            TorAuth::Auto => {
                if info.supports("NULL") {
                    String::new()
                } else if info.supports("COOKIE") {
                    let path = info.cookie_file.clone().ok_or_else(|| {
                        TorControlError::Auth("COOKIE advertised without COOKIEFILE".to_string())
                    })?;
                    read_cookie(&path).await?
                } else {
                    return Err(TorControlError::Auth(format!(
                        "no usable method among {:?}; configure a password or cookie",
                        info.auth_methods
                    )));
                }
            }
        };

        let cmd = if credential.is_empty() {
            "AUTHENTICATE".to_string()
        } else {
            format!("AUTHENTICATE {}", credential)
        };
        let reply = self.command(&cmd).await.map_err(|e| match e {
            TorControlError::Rejected { message, .. } => TorControlError::Auth(message),
            other => other,
        })?;
        debug!(code = reply.code, "Authenticated to Tor control port");
        Ok(())
    }

    /// Publish an onion service for `key_blob` (`ED25519-V3:<base64>`)
    /// forwarding `virtual_port` to `target`. Returns the service id Tor reports.
    pub async fn add_onion(&mut self, key_blob: &str, virtual_port: u16, target: &str) -> Result<String> {
        let reply = self
            .command(&format!(
                "ADD_ONION {} Flags=DiscardPK Port={},{}",
                key_blob, virtual_port, target
            ))
            .await?;
        reply
            .value("ServiceID")
            .ok_or_else(|| TorControlError::Protocol("ADD_ONION reply without ServiceID".to_string()))
    }

    pub async fn del_onion(&mut self, service_id: &str) -> Result<()> {
        self.command(&format!("DEL_ONION {}", service_id)).await?;
        Ok(())
    }

    /// Send QUIT and close the connection
    pub async fn quit(&mut self) -> Result<()> {
        let result = self.command("QUIT").await.map(|_| ());
        // Tor hangs up after replying
        self.stream.get_mut().shutdown().await.ok();
        result
    }

    /// Send one command; non-250 replies become `Rejected`
    pub async fn command(&mut self, command: &str) -> Result<Reply> {
        let deadline = self.timeout;
        let reply = timeout(deadline, async {
            trace!(command = %redact(command), "Tor control ->");
            let stream = self.stream.get_mut();
            stream.write_all(command.as_bytes()).await?;
            stream.write_all(b"\r\n").await?;
            stream.flush().await?;
            self.read_reply().await
        })
        .await
        .map_err(|_| TorControlError::Timeout("Tor control reply"))??;

        if !reply.is_ok() {
            return Err(TorControlError::Rejected {
                code: reply.code,
                message: reply.message(),
            });
        }
        Ok(reply)
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Err(TorControlError::ConnectionFailed(
                "control connection closed by Tor".to_string(),
            ));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Read `NNN-text`, `NNN+text` (data block to a lone `.`) lines until `NNN text`
    async fn read_reply(&mut self) -> Result<Reply> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            trace!(reply = %line, "Tor control <-");
            if line.len() < 4 || !line.is_char_boundary(3) || !line.is_char_boundary(4) {
                return Err(TorControlError::Protocol(format!("malformed reply: {:?}", line)));
            }
            let code: u16 = line[..3]
                .parse()
                .map_err(|_| TorControlError::Protocol(format!("bad status code: {:?}", line)))?;
            let text = line[4..].to_string();

            match &line[3..4] {
                " " => {
                    lines.push(text);
                    return Ok(Reply { code, lines });
                }
                "-" => lines.push(text),
                "+" => {
                    lines.push(text);
                    loop {
                        let data = self.read_line().await?;
                        if data == "." {
                            break;
                        }
                        lines.push(data.strip_prefix('.').map(str::to_string).unwrap_or(data));
                    }
                }
                _ => {
                    return Err(TorControlError::Protocol(format!(
                        "bad reply separator: {:?}",
                        line
                    )))
                }
            }
        }
    }
}

async fn read_cookie(path: &Path) -> Result<String> {
    let cookie = tokio::fs::read(path)
        .await
        .map_err(|e| TorControlError::Auth(format!("cannot read {}: {}", path.display(), e)))?;
    Ok(hex::encode(cookie))
}

/// Hide key material and credentials in trace output
fn redact(command: &str) -> String {
    if command.starts_with("AUTHENTICATE ") {
        return "AUTHENTICATE <redacted>".to_string();
    }
    command
        .split(' ')
        .map(|token| {
            if token.starts_with("ED25519-V3:") {
                "ED25519-V3:<redacted>"
            } else {
                token
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_info_parsing() {
        let reply = Reply {
            code: 250,
            lines: vec![
                "PROTOCOLINFO 1".to_string(),
                r#"AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE="/run/tor/control.authcookie""#
                    .to_string(),
                r#"VERSION Tor="0.4.8.9""#.to_string(),
                "OK".to_string(),
            ],
        };
        let info = ProtocolInfo::from_reply(&reply);
        assert!(info.supports("COOKIE"));
        assert!(info.supports("SAFECOOKIE"));
        assert!(!info.supports("NULL"));
        assert_eq!(
            info.cookie_file,
            Some(PathBuf::from("/run/tor/control.authcookie"))
        );
        assert_eq!(info.tor_version.as_deref(), Some("0.4.8.9"));
    }

    #[test]
    fn test_reply_value() {
        let reply = Reply {
            code: 250,
            lines: vec!["ServiceID=abcdef".to_string(), "OK".to_string()],
        };
        assert_eq!(reply.value("ServiceID").as_deref(), Some("abcdef"));
        assert_eq!(reply.value("PrivateKey"), None);
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
        assert_eq!(
            quoted_value(r#"X="pa\"ss""#, "X=").as_deref(),
            Some(r#"pa"ss"#)
        );
    }

    #[test]
    fn test_redaction() {
        assert_eq!(redact("AUTHENTICATE \"secret\""), "AUTHENTICATE <redacted>");
        assert_eq!(
            redact("ADD_ONION ED25519-V3:abc Port=80,127.0.0.1:1"),
            "ADD_ONION ED25519-V3:<redacted> Port=80,127.0.0.1:1"
        );
    }

    // Requires a running Tor with ControlPort 9051
    #[tokio::test]
    #[ignore]
    async fn test_live_protocol_info() {
        let mut control = TorControl::connect("127.0.0.1:9051", Duration::from_secs(5))
            .await
            .unwrap();
        let info = control.protocol_info().await.unwrap();
        assert!(!info.auth_methods.is_empty());
    }
}
