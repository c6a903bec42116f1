use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::Response,
    routing::get,
    Router,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::hub::{ClientId, Gateway};
use super::messages::Outbound;

const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Router exposing the realtime channel at `/ws`.
pub fn gateway_router(gateway: Gateway) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(gateway)
}

pub(crate) async fn ws_handler(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let remote = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(',').next().unwrap_or(value).trim().to_string());
    upgrade.on_upgrade(move |socket| serve_socket(gateway, socket, remote))
}

async fn serve_socket(gateway: Gateway, socket: WebSocket, remote: Option<String>) {
    let (client_id, outbound) = gateway.connect(remote);
    let (sink, stream) = socket.split();
    run_connection(gateway, client_id, outbound, sink, stream).await;
}

/// Drives one connection until the peer leaves or the gateway closes it.
/// Returning drops both socket halves, which tears the connection down even
/// when the peer never answers our close frame.
pub(crate) async fn run_connection<Si, St, E>(
    gateway: Gateway,
    client_id: ClientId,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    mut sink: Si,
    mut stream: St,
) where
    Si: Sink<Message> + Unpin,
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: std::error::Error,
{
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                match frame {
                    Outbound::Message(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Ping => {
                        if sink.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close { code, reason } => {
                        let close = Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        }));
                        if tokio::time::timeout(CLOSE_GRACE, sink.send(close)).await.is_err() {
                            debug!(client_id = %client_id, "close frame not flushed in time");
                        }
                        break;
                    }
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => gateway.on_message(&client_id, &text),
                Some(Ok(Message::Binary(bytes))) => {
                    gateway.on_message(&client_id, &String::from_utf8_lossy(&bytes))
                }
                Some(Ok(Message::Pong(_))) => gateway.on_pong(&client_id),
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    gateway.on_error(&client_id, &err);
                    break;
                }
            },
        }
    }

    debug!(client_id = %client_id, "realtime socket closed");
    gateway.disconnect(&client_id);
}
