//! Per-connection WebSocket I/O: one task per connection reading client
//! frames and writing outbound frames from the hub's queue via a
//! `tokio::select!` over (outbound, inbound).

use axum::extract::ws::{Message, WebSocket};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::{Exchange, Trade};

use super::hub::Hub;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { exchange: Exchange, market_id: String },
    Unsubscribe { exchange: Exchange, market_id: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected { message: String },
    Subscribed { exchange: Exchange, market_id: String },
    Unsubscribed { exchange: Exchange, market_id: String },
    Trade { data: Trade },
    Error { message: String },
}

/// Drives one connection's full lifecycle:
/// `connected → (subscribing|subscribed|unsubscribing)* → closing → closed`.
pub async fn handle_socket(mut socket: WebSocket, hub: Hub) {
    let (conn_id, outbound) = hub.register();

    let hello = serde_json::to_string(&ServerFrame::Connected {
        message: "connected".to_string(),
    })
    .unwrap_or_default();
    if socket.send(Message::Text(hello)).await.is_err() {
        hub.close(conn_id);
        return;
    }

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        let text = serde_json::to_string(&frame).unwrap_or_default();
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Hub closed us (abuse threshold, explicit unsubscribe-all
                        // path, or shutdown). Any pending error frame was already
                        // flushed above; send a normal-closure frame and stop.
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_frame(&hub, conn_id, &mut socket, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "ws: socket read error");
                        break;
                    }
                }
            }
        }
    }

    hub.close(conn_id);
}

async fn handle_client_frame(hub: &Hub, conn_id: super::hub::ConnId, socket: &mut WebSocket, text: &str) {
    let parsed: Result<ClientFrame, _> = serde_json::from_str(text);

    let response = match parsed {
        Ok(ClientFrame::Subscribe { exchange, market_id }) => {
            hub.subscribe(conn_id, exchange, &market_id);
            ServerFrame::Subscribed { exchange, market_id }
        }
        Ok(ClientFrame::Unsubscribe { exchange, market_id }) => {
            hub.unsubscribe(conn_id, exchange, &market_id);
            ServerFrame::Unsubscribed { exchange, market_id }
        }
        Err(e) => ServerFrame::Error {
            message: format!("bad frame: {e}"),
        },
    };

    let text = serde_json::to_string(&response).unwrap_or_default();
    let _ = socket.send(Message::Text(text)).await;
}
