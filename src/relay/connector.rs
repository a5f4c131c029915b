//! Relay connection seam
//!
//! A [`Connector`] turns a relay URL into a pair of text channels. The pool
//! never touches sockets directly; [`WsConnector`] is the websocket
//! implementation and tests plug in an in-memory relay.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::debug;

use crate::error::TransportError;

/// An established relay connection. Dropping `outbound` closes it; `inbound`
/// yields `None` once the relay side is gone.
pub struct RelayLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<RelayLink, TransportError>;
}

/// Websocket connector
pub struct WsConnector {
    timeout: Duration,
}

impl WsConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<RelayLink, TransportError> {
        let (ws, _response) = tokio::time::timeout(self.timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::Unreachable {
                url: url.to_string(),
                reason: "connect timeout".into(),
            })?
            .map_err(|e| TransportError::Unreachable {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        let writer_url = url.to_string();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(relay = %writer_url, error = %e, "Relay write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_url = url.to_string();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(relay = %reader_url, error = %e, "Relay read failed");
                        break;
                    }
                }
            }
        });

        Ok(RelayLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
