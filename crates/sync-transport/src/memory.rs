//! In-process connector for driving the transport and synchronizers
//! without a network.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sync_core::{ChannelEvent, SyncError, SyncErrorCategory};
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::client::{Connector, FrameConnection, WireFrame};

#[derive(Debug, Default)]
struct ServerState {
    refuse: bool,
    opened: Vec<Url>,
    close_codes: Vec<u16>,
}

/// Client half: hand it to a [`crate::TransportClient`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<ServerState>>,
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
}

/// Server half: accepts connections opened through the paired connector.
#[derive(Debug)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

pub fn memory_channel() -> (MemoryConnector, MemoryServer) {
    let state = Arc::new(Mutex::new(ServerState::default()));
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            state: Arc::clone(&state),
            accept_tx,
        },
        MemoryServer { state, accept_rx },
    )
}

impl MemoryServer {
    /// Next connection the client opened, in open order.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Refuse subsequent opens with a network error.
    pub fn set_refuse(&self, refuse: bool) {
        lock(&self.state).refuse = refuse;
    }

    /// Open attempts so far, refused ones included.
    pub fn open_count(&self) -> usize {
        lock(&self.state).opened.len()
    }

    pub fn opened_urls(&self) -> Vec<Url> {
        lock(&self.state).opened.clone()
    }

    /// Codes the client closed its connections with.
    pub fn close_codes(&self) -> Vec<u16> {
        lock(&self.state).close_codes.clone()
    }
}

/// Server-side end of one open connection.
#[derive(Debug)]
pub struct MemoryPeer {
    url: Url,
    to_client: mpsc::UnboundedSender<WireFrame>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// URL the client opened, credential included.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn push_text(&self, text: &str) {
        let _ = self.to_client.send(WireFrame::Text(text.to_owned()));
    }

    pub fn push_event(&self, event: &ChannelEvent) {
        match serde_json::to_string(event) {
            Ok(text) => self.push_text(&text),
            Err(err) => debug!(error = %err, "memory peer could not encode event"),
        }
    }

    /// Close with a code, as a server would with a close frame.
    pub fn close(&self, code: u16) {
        let _ = self.to_client.send(WireFrame::Closed(code));
    }

    /// Vanish without a close frame.
    pub fn drop_connection(self) {}

    /// Next frame the client wrote; `None` after the client went away.
    pub async fn next_sent(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// A frame the client already sent, without waiting.
    pub fn try_next_sent(&mut self) -> Option<String> {
        self.from_client.try_recv().ok()
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    state: Arc<Mutex<ServerState>>,
    incoming: mpsc::UnboundedReceiver<WireFrame>,
    outgoing: mpsc::UnboundedSender<String>,
}

impl Connector for MemoryConnector {
    type Conn = MemoryConnection;

    async fn open(&self, url: &Url) -> Result<MemoryConnection, SyncError> {
        let refuse = {
            let mut state = lock(&self.state);
            state.opened.push(url.clone());
            state.refuse
        };
        if refuse {
            return Err(SyncError::new(
                SyncErrorCategory::Network,
                "channel_open_failed",
                "connection refused",
            ));
        }

        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        self.accept_tx
            .send(MemoryPeer {
                url: url.clone(),
                to_client,
                from_client,
            })
            .map_err(|_| {
                SyncError::new(
                    SyncErrorCategory::Network,
                    "channel_open_failed",
                    "memory server is gone",
                )
            })?;

        Ok(MemoryConnection {
            state: Arc::clone(&self.state),
            incoming,
            outgoing,
        })
    }
}

impl FrameConnection for MemoryConnection {
    async fn recv(&mut self) -> Option<WireFrame> {
        self.incoming.recv().await
    }

    async fn send(&mut self, text: String) -> Result<(), SyncError> {
        self.outgoing.send(text).map_err(|_| {
            SyncError::new(
                SyncErrorCategory::Network,
                "channel_send_failed",
                "memory peer is gone",
            )
        })
    }

    async fn close(&mut self, code: u16) {
        lock(&self.state).close_codes.push(code);
        self.incoming.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
