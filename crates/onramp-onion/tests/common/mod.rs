//! In-process Tor control port and SOCKS5 proxy for integration tests

#![allow(dead_code)]

use onramp_onion::{OnionConfig, TorAuth};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Service id the fake reports when none is configured
pub const FAKE_SERVICE_ID: &str = "fakeservicefakeservicefakeservicefakeservicefakeservicd";

#[derive(Default)]
pub struct TorStats {
    pub connections: AtomicUsize,
    pub authenticated: AtomicUsize,
    pub quits: AtomicUsize,
    pub add_onion: Mutex<Vec<String>>,
    pub del_onion: Mutex<Vec<String>>,
}

impl TorStats {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn authenticated(&self) -> usize {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn quits(&self) -> usize {
        self.quits.load(Ordering::SeqCst)
    }

    pub fn add_onion(&self) -> Vec<String> {
        self.add_onion.lock().unwrap().clone()
    }

    pub fn del_onion(&self) -> Vec<String> {
        self.del_onion.lock().unwrap().clone()
    }

    /// `host:port` the last ADD_ONION asked Tor to forward to
    pub fn forward_target(&self) -> Option<String> {
        let commands = self.add_onion();
        let last = commands.last()?;
        last.split(' ')
            .find_map(|token| token.strip_prefix("Port="))
            .and_then(|mapping| mapping.split_once(','))
            .map(|(_, target)| target.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct FakeTorOptions {
    /// Advertised in PROTOCOLINFO, e.g. `NULL` or `COOKIE,SAFECOOKIE`
    pub methods: String,
    pub cookie_file: Option<PathBuf>,
    /// Exact AUTHENTICATE argument accepted; empty for NULL
    pub credential: String,
    /// Service id returned from ADD_ONION
    pub service_id: String,
}

impl Default for FakeTorOptions {
    fn default() -> Self {
        FakeTorOptions {
            methods: "NULL".to_string(),
            cookie_file: None,
            credential: String::new(),
            service_id: FAKE_SERVICE_ID.to_string(),
        }
    }
}

pub struct FakeTor {
    pub addr: String,
    pub stats: Arc<TorStats>,
}

impl FakeTor {
    pub async fn start() -> Self {
        Self::start_with(FakeTorOptions::default()).await
    }

    pub async fn start_with(options: FakeTorOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let stats = Arc::new(TorStats::default());
        let options = Arc::new(options);

        let server_stats = stats.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                server_stats.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handle_control(
                    socket,
                    server_stats.clone(),
                    options.clone(),
                ));
            }
        });

        FakeTor { addr, stats }
    }
}

async fn handle_control(socket: TcpStream, stats: Arc<TorStats>, options: Arc<FakeTorOptions>) {
    let (read, mut write) = socket.into_split();
    let mut reader = BufReader::new(read);
    let mut authenticated = false;

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = line.trim_end();

        let (reply, hang_up) = if line.starts_with("PROTOCOLINFO") {
            let cookie = options
                .cookie_file
                .as_ref()
                .map(|p| format!(" COOKIEFILE=\"{}\"", p.display()))
                .unwrap_or_default();
            (
                format!(
                    "250-PROTOCOLINFO 1\r\n250-AUTH METHODS={}{}\r\n250-VERSION Tor=\"0.4.8.9\"\r\n250 OK\r\n",
                    options.methods, cookie
                ),
                false,
            )
        } else if let Some(rest) = line.strip_prefix("AUTHENTICATE") {
            if rest.trim() == options.credential {
                authenticated = true;
                stats.authenticated.fetch_add(1, Ordering::SeqCst);
                ("250 OK\r\n".to_string(), false)
            } else {
                (
                    "515 Authentication failed: Password did not match HashedControlPassword *or* authentication cookie.\r\n"
                        .to_string(),
                    true,
                )
            }
        } else if line == "QUIT" {
            stats.quits.fetch_add(1, Ordering::SeqCst);
            ("250 closing connection\r\n".to_string(), true)
        } else if !authenticated {
            ("514 Authentication required.\r\n".to_string(), true)
        } else if line.starts_with("ADD_ONION") {
            stats.add_onion.lock().unwrap().push(line.to_string());
            (
                format!("250-ServiceID={}\r\n250 OK\r\n", options.service_id),
                false,
            )
        } else if let Some(id) = line.strip_prefix("DEL_ONION ") {
            stats.del_onion.lock().unwrap().push(id.to_string());
            ("250 OK\r\n".to_string(), false)
        } else {
            ("510 Unrecognized command\r\n".to_string(), false)
        };

        if write.write_all(reply.as_bytes()).await.is_err() || hang_up {
            return;
        }
    }
}

/// SOCKS5 proxy that records CONNECT targets and echoes the stream back
pub struct FakeSocks {
    pub addr: String,
    pub requests: Arc<Mutex<Vec<(String, u16)>>>,
}

impl FakeSocks {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(handle_socks(socket, recorded.clone()));
            }
        });

        FakeSocks { addr, requests }
    }

    pub fn requests(&self) -> Vec<(String, u16)> {
        self.requests.lock().unwrap().clone()
    }
}

async fn handle_socks(
    mut socket: TcpStream,
    requests: Arc<Mutex<Vec<(String, u16)>>>,
) -> std::io::Result<()> {
    let mut header = [0u8; 2];
    socket.read_exact(&mut header).await?;
    let mut methods = vec![0u8; header[1] as usize];
    socket.read_exact(&mut methods).await?;
    socket.write_all(&[0x05, 0x00]).await?;

    let mut request = [0u8; 4];
    socket.read_exact(&mut request).await?;
    if request[3] != 0x03 {
        socket
            .write_all(&[0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await?;
        return Ok(());
    }
    let mut len = [0u8; 1];
    socket.read_exact(&mut len).await?;
    let mut host = vec![0u8; len[0] as usize];
    socket.read_exact(&mut host).await?;
    let mut port = [0u8; 2];
    socket.read_exact(&mut port).await?;

    let host = String::from_utf8_lossy(&host).to_string();
    let unreachable = host.starts_with("unreachable");
    requests
        .lock()
        .unwrap()
        .push((host, u16::from_be_bytes(port)));

    if unreachable {
        socket
            .write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await?;
        return Ok(());
    }
    socket
        .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
        .await?;

    let (mut read, mut write) = socket.split();
    tokio::io::copy(&mut read, &mut write).await?;
    Ok(())
}

/// Onion config pointing at the fakes
pub fn config(tor: &FakeTor, socks: &FakeSocks) -> OnionConfig {
    OnionConfig {
        control_addr: tor.addr.clone(),
        socks_addr: socks.addr.clone(),
        auth: TorAuth::Auto,
        control_timeout_secs: 5,
        ..Default::default()
    }
}
