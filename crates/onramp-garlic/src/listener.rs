//! Stream listener for a Garlic session

use crate::keys::destination_base32;
use crate::sam::{SamConnection, SamError};
use async_trait::async_trait;
use onramp_core::{BoxedConn, Listener, OnrampError, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Accepts inbound I2P streams. Each `accept` opens a fresh bridge
/// connection and issues `STREAM ACCEPT` on it.
pub struct StreamListener {
    sam_addr: String,
    session_id: String,
    control_timeout: Duration,
    local_addr: String,
    closed: CancellationToken,
}

impl StreamListener {
    pub(crate) fn new(
        sam_addr: String,
        session_id: String,
        control_timeout: Duration,
        local_addr: String,
    ) -> Self {
        StreamListener {
            sam_addr,
            session_id,
            control_timeout,
            local_addr,
            closed: CancellationToken::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn accept_one(&self) -> std::result::Result<(BoxedConn, String), SamError> {
        let conn = SamConnection::connect(&self.sam_addr, self.control_timeout).await?;
        let (stream, remote) = conn.stream_accept(&self.session_id).await?;

        // Report peers by their short address when the destination parses
        let peer = destination_base32(&remote).unwrap_or(remote);
        debug!(session = %self.session_id, peer = %peer, "Accepted I2P stream");

        Ok((Box::new(stream) as BoxedConn, peer))
    }
}

#[async_trait]
impl Listener for StreamListener {
    async fn accept(&self) -> Result<(BoxedConn, String)> {
        if self.closed.is_cancelled() {
            return Err(OnrampError::Closed);
        }
        tokio::select! {
            _ = self.closed.cancelled() => Err(OnrampError::Closed),
            accepted = self.accept_one() => accepted.map_err(|e| {
                OnrampError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionAborted, e))
            }),
        }
    }

    fn addr(&self) -> String {
        self.local_addr.clone()
    }

    async fn close(&self) -> Result<()> {
        debug!(session = %self.session_id, "Closing I2P stream listener");
        self.closed.cancel();
        Ok(())
    }
}
