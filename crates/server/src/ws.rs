//! Live channel: one WebSocket per client, authenticated once at upgrade.
//!
//! Inbound text frames are decoded into [`ClientEvent`]s and handed to the
//! shared ingress handler. Outbound events arrive on the connection's hub
//! channel and a writer task forwards them as JSON text frames. The hub owns
//! the only sender, so removing the connection from the hub ends the writer.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use server_api::{auth::verify_token, ingress::handle_client_event};
use shared::{
    domain::Identity,
    error::ApiError,
    protocol::{ClientEvent, ServerEvent},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn};

use crate::{error_response, AppState};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// `GET /ws?token=<jwt>`. The token is checked before the upgrade so a bad
/// token is a plain 401.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match query.token.as_deref() {
        Some(token) => verify_token(&state.api.auth, token),
        None => Err(ApiError::unauthorized("missing token")),
    };
    let identity = match identity {
        Ok(identity) => identity,
        Err(error) => {
            warn!(%error, "live connection refused");
            return error_response(error).into_response();
        }
    };

    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| live_connection(state, socket, identity))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

async fn live_connection(state: Arc<AppState>, socket: WebSocket, identity: Identity) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = state.api.hub.connect(tx);
    info!(%connection, user_id = %identity.user_id, "live connection opened");

    let (mut sink, mut stream) = socket.split();
    let mut outbound = UnboundedReceiverStream::new(rx);
    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.next().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(error) => {
                    warn!(%connection, %error, "dropping unserializable event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let event = match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => event,
            Err(error) => {
                warn!(%connection, %error, "malformed live frame");
                state.api.hub.send_to(
                    connection,
                    ServerEvent::Error(ApiError::validation(format!("malformed frame: {error}"))),
                );
                continue;
            }
        };

        if handle_client_event(&state.api, connection, identity, event)
            .await
            .is_break()
        {
            break;
        }
    }

    // Transport close without a `disconnect` frame gets the same cleanup.
    if let Some(user_id) = state.api.hub.disconnect(connection) {
        info!(%connection, %user_id, "presence cleared on close");
    }
    let _ = writer.await;
    info!(%connection, "live connection closed");
}
