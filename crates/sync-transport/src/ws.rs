use futures_util::{SinkExt, StreamExt};
use sync_core::{SyncError, SyncErrorCategory, classify_http_status};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, trace, warn};
use url::Url;

use crate::client::{Connector, FrameConnection, WireFrame};

/// Close code reported when the peer sent a close frame without a status.
const NO_STATUS_RECEIVED: u16 = 1005;

/// WebSocket connector (`ws://` and `wss://`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    type Conn = WsConnection;

    async fn open(&self, url: &Url) -> Result<WsConnection, SyncError> {
        let (stream, response) = connect_async(url.as_str())
            .await
            .map_err(map_handshake_error)?;
        debug!(status = %response.status(), "websocket handshake complete");
        Ok(WsConnection { stream })
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl FrameConnection for WsConnection {
    async fn recv(&mut self) -> Option<WireFrame> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(WireFrame::Text(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(WireFrame::Text(text)),
                    Err(_) => warn!("dropping non-utf8 binary frame"),
                },
                Ok(Message::Close(frame)) => {
                    let code = frame
                        .map(|frame| u16::from(frame.code))
                        .unwrap_or(NO_STATUS_RECEIVED);
                    return Some(WireFrame::Closed(code));
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {
                    trace!("websocket control frame");
                }
                Err(err) => {
                    warn!(error = %err, "websocket read failed");
                    return None;
                }
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), SyncError> {
        self.stream.send(Message::Text(text)).await.map_err(|err| {
            SyncError::new(
                SyncErrorCategory::Network,
                "channel_send_failed",
                err.to_string(),
            )
        })
    }

    async fn close(&mut self, code: u16) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        if let Err(err) = self.stream.close(Some(frame)).await {
            debug!(error = %err, "websocket close handshake failed");
        }
    }
}

fn map_handshake_error(err: tungstenite::Error) -> SyncError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            SyncError::new(
                classify_http_status(status),
                "channel_handshake_rejected",
                format!("websocket upgrade rejected with HTTP {status}"),
            )
        }
        tungstenite::Error::Url(err) => SyncError::new(
            SyncErrorCategory::Config,
            "invalid_channel_url",
            err.to_string(),
        ),
        other => SyncError::new(
            SyncErrorCategory::Network,
            "channel_open_failed",
            other.to_string(),
        ),
    }
}
