use std::ops::ControlFlow;

use shared::{
    domain::{ConnectionId, Identity, UserId},
    error::ApiError,
    protocol::{ClientEvent, ServerEvent},
};
use tracing::{info, warn};

use crate::{append_and_broadcast, join_conversation, relay_typing, ApiContext};

/// Dispatches one event from an authenticated live connection. Failures are
/// reported back to that connection only. Returns `Break` once the connection
/// has been torn down.
pub async fn handle_client_event(
    ctx: &ApiContext,
    connection: ConnectionId,
    identity: Identity,
    event: ClientEvent,
) -> ControlFlow<()> {
    match event {
        ClientEvent::Register { user_id } => {
            if let Err(error) = ensure_acting_as(identity, user_id) {
                reject(ctx, connection, error);
                return ControlFlow::Continue(());
            }
            let previous = ctx.hub.register(user_id, connection);
            info!(
                %user_id,
                %connection,
                superseded = previous.is_some_and(|previous| previous != connection),
                "user registered"
            );
        }
        ClientEvent::Join { conversation_id } => {
            match join_conversation(ctx, identity.user_id, connection, conversation_id).await {
                Ok(()) => info!(%conversation_id, %connection, "joined conversation"),
                Err(error) => reject(ctx, connection, error),
            }
        }
        ClientEvent::SendMessage {
            conversation_id,
            sender_id,
            content,
        } => {
            let result = match ensure_acting_as(identity, sender_id) {
                Ok(()) => {
                    append_and_broadcast(ctx, conversation_id, sender_id, content.as_deref())
                        .await
                        .map(|_| ())
                }
                Err(error) => Err(error),
            };
            if let Err(error) = result {
                warn!(%conversation_id, %connection, %error, "live message rejected");
                ctx.hub
                    .send_to(connection, ServerEvent::MessageError { error });
            }
        }
        ClientEvent::Typing {
            conversation_id,
            user_id,
            is_typing,
        } => {
            let result = ensure_acting_as(identity, user_id).and_then(|()| {
                relay_typing(ctx, connection, user_id, conversation_id, is_typing)
            });
            if let Err(error) = result {
                reject(ctx, connection, error);
            }
        }
        ClientEvent::Disconnect => {
            let user_id = ctx.hub.disconnect(connection);
            info!(%connection, user_id = ?user_id, "connection closed");
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

/// Live payloads name a user; it has to be the one the connection
/// authenticated as.
fn ensure_acting_as(identity: Identity, claimed: UserId) -> Result<(), ApiError> {
    if identity.user_id != claimed {
        return Err(ApiError::forbidden(format!(
            "connection is authenticated as user {}",
            identity.user_id
        )));
    }
    Ok(())
}

fn reject(ctx: &ApiContext, connection: ConnectionId, error: ApiError) {
    warn!(%connection, %error, "live event rejected");
    ctx.hub.send_to(connection, ServerEvent::Error(error));
}

#[cfg(test)]
#[path = "tests/ingress_tests.rs"]
mod tests;
