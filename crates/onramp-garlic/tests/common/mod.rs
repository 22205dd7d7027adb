//! In-process SAM bridge for integration tests

#![allow(dead_code)]

use base64::Engine;
use onramp_garlic::keys::I2P_BASE64;
use onramp_garlic::GarlicConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Route library logs to the test harness; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Greeting the fake peer sends on every accepted stream
pub const PEER_GREETING: &[u8] = b"hello from peer";

#[derive(Default)]
pub struct Stats {
    pub hellos: AtomicUsize,
    pub generated: AtomicUsize,
    pub lookups: AtomicUsize,
    pub connects: AtomicUsize,
    pub accepts: AtomicUsize,
    pub sessions: Mutex<Vec<String>>,
}

impl Stats {
    pub fn hellos(&self) -> usize {
        self.hellos.load(Ordering::SeqCst)
    }

    pub fn generated(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<String> {
        self.sessions.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FakeSamOptions {
    /// Answer every SESSION CREATE with an error
    pub reject_sessions: bool,
}

pub struct FakeSam {
    pub addr: String,
    pub stats: Arc<Stats>,
}

impl FakeSam {
    pub async fn start() -> Self {
        Self::start_with(FakeSamOptions::default()).await
    }

    pub async fn start_with(options: FakeSamOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let stats = Arc::new(Stats::default());

        let server_stats = stats.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(handle(socket, server_stats.clone(), options));
            }
        });

        FakeSam { addr, stats }
    }

    /// Garlic config pointing at this bridge
    pub fn config(&self) -> GarlicConfig {
        GarlicConfig {
            control_timeout_secs: 5,
            ..GarlicConfig::with_sam_addr(self.addr.clone())
        }
    }
}

/// Deterministic destination-shaped key pair for the n-th generation
pub fn destination(n: usize) -> (String, String) {
    let public: Vec<u8> = (0..387usize).map(|i| (i * 7 + n * 13) as u8).collect();
    let private: Vec<u8> = (0..663usize).map(|i| (i * 3 + n * 31) as u8).collect();
    (I2P_BASE64.encode(public), I2P_BASE64.encode(private))
}

fn value(line: &str, key: &str) -> String {
    line.split_whitespace()
        .find_map(|token| token.strip_prefix(key))
        .unwrap_or_default()
        .to_string()
}

async fn handle(socket: TcpStream, stats: Arc<Stats>, options: FakeSamOptions) {
    let (read, mut write) = socket.into_split();
    let mut reader = BufReader::new(read);

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = line.trim();

        let reply = if line.starts_with("HELLO VERSION") {
            stats.hellos.fetch_add(1, Ordering::SeqCst);
            "HELLO REPLY RESULT=OK VERSION=3.3\n".to_string()
        } else if line.starts_with("DEST GENERATE") {
            let n = stats.generated.fetch_add(1, Ordering::SeqCst) + 1;
            let (public, private) = destination(n);
            format!("DEST REPLY PUB={} PRIV={}\n", public, private)
        } else if line.starts_with("SESSION CREATE") {
            if options.reject_sessions {
                "SESSION STATUS RESULT=I2P_ERROR MESSAGE=\"tunnels unavailable\"\n".to_string()
            } else {
                let id = value(line, "ID=");
                let mut sessions = stats.sessions.lock().unwrap();
                if sessions.contains(&id) {
                    "SESSION STATUS RESULT=DUPLICATED_ID\n".to_string()
                } else {
                    sessions.push(id);
                    format!(
                        "SESSION STATUS RESULT=OK DESTINATION={}\n",
                        value(line, "DESTINATION=")
                    )
                }
            }
        } else if line.starts_with("NAMING LOOKUP") {
            stats.lookups.fetch_add(1, Ordering::SeqCst);
            let name = value(line, "NAME=");
            if name.starts_with("missing") {
                format!("NAMING REPLY RESULT=KEY_NOT_FOUND NAME={}\n", name)
            } else {
                format!(
                    "NAMING REPLY RESULT=OK NAME={} VALUE={}\n",
                    name,
                    destination(1000).0
                )
            }
        } else if line.starts_with("STREAM CONNECT") {
            stats.connects.fetch_add(1, Ordering::SeqCst);
            if write.write_all(b"STREAM STATUS RESULT=OK\n").await.is_err() {
                return;
            }
            // Echo everything back
            let _ = tokio::io::copy(&mut reader, &mut write).await;
            return;
        } else if line.starts_with("STREAM ACCEPT") {
            stats.accepts.fetch_add(1, Ordering::SeqCst);
            let peer = destination(2000).0;
            let preamble = format!("STREAM STATUS RESULT=OK\n{} FROM_PORT=0 TO_PORT=0\n", peer);
            if write.write_all(preamble.as_bytes()).await.is_err()
                || write.write_all(PEER_GREETING).await.is_err()
            {
                return;
            }
            let _ = tokio::io::copy(&mut reader, &mut write).await;
            return;
        } else {
            "ERROR RESULT=I2P_ERROR MESSAGE=\"unknown command\"\n".to_string()
        };

        if write.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}
