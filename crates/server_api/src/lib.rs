use shared::{
    domain::{ConnectionId, ConversationId, Identity, Role, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ConversationRecord, ConversationSummary, CreateConversationRequest, MessageView,
        ParticipantSummary, SenderSummary, ServerEvent,
    },
};
use storage::{Storage, StoredConversation, StoredMessage, StoredParticipant};
use tracing::{error, info, warn};

pub mod auth;
pub mod authz;
pub mod ingress;
pub mod live;

use auth::AuthConfig;
use live::LiveHub;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub hub: LiveHub,
    pub auth: AuthConfig,
}

/// Starts (or returns) the caller's conversation with the named counterpart.
/// The flag is `true` when this call created it.
pub async fn create_conversation(
    ctx: &ApiContext,
    identity: Identity,
    request: &CreateConversationRequest,
) -> Result<(ConversationRecord, bool), ApiError> {
    let counterpart_id = match identity.role {
        Role::Patient => request.doctor_id,
        Role::Doctor => request.patient_id,
        Role::MedicineCompany => None,
    };
    let pair = authz::can_create_conversation(identity.role, identity.user_id, counterpart_id)?;

    let (counterpart_id, expected_role) = if identity.role == Role::Patient {
        (pair.doctor_id, Role::Doctor)
    } else {
        (pair.patient_id, Role::Patient)
    };
    let counterpart = ctx
        .storage
        .user_profile(counterpart_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("{expected_role} not found")))?;
    if counterpart.role != expected_role {
        return Err(ApiError::validation(format!(
            "user {counterpart_id} is not a {expected_role}"
        )));
    }

    let (conversation, created) = ctx
        .storage
        .find_or_create_conversation(pair.patient_id, pair.doctor_id)
        .await
        .map_err(internal)?;
    if created {
        info!(
            conversation_id = %conversation.conversation_id,
            patient_id = %pair.patient_id,
            doctor_id = %pair.doctor_id,
            "conversation created"
        );
    }
    Ok((conversation_record(conversation), created))
}

pub async fn list_conversations(
    ctx: &ApiContext,
    identity: Identity,
) -> Result<Vec<ConversationSummary>, ApiError> {
    let conversations = ctx
        .storage
        .list_conversations_for_user(identity.user_id, identity.role)
        .await
        .map_err(internal)?;

    Ok(conversations
        .into_iter()
        .map(|summary| ConversationSummary {
            id: summary.conversation.conversation_id,
            patient: participant_summary(summary.patient),
            doctor: participant_summary(summary.doctor),
            created_at: summary.conversation.created_at,
            updated_at: summary.conversation.updated_at,
        })
        .collect())
}

pub async fn get_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<ConversationRecord, ApiError> {
    let conversation = load_accessible_conversation(ctx, user_id, conversation_id).await?;
    Ok(conversation_record(conversation))
}

pub async fn list_messages(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<Vec<MessageView>, ApiError> {
    load_accessible_conversation(ctx, user_id, conversation_id).await?;
    let messages = ctx
        .storage
        .list_conversation_messages(conversation_id)
        .await
        .map_err(internal)?;
    Ok(messages.into_iter().map(message_view).collect())
}

/// The one write path for messages, shared by HTTP requests and live
/// `send_message` events: authorize, persist, bump activity, broadcast.
///
/// A broadcast that reaches nobody is still a success, and a failed activity
/// bump is only logged; the persisted message is never rolled back.
pub async fn append_and_broadcast(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    sender_id: UserId,
    content: Option<&str>,
) -> Result<MessageView, ApiError> {
    load_accessible_conversation(ctx, sender_id, conversation_id).await?;
    let Some(content) = content.filter(|content| !content.trim().is_empty()) else {
        return Err(ApiError::validation("message content required"));
    };

    let stored = ctx
        .storage
        .insert_message(conversation_id, sender_id, content)
        .await
        .map_err(internal)?;

    if let Err(error) = ctx.storage.touch_conversation(conversation_id).await {
        warn!(%conversation_id, %error, "failed to bump conversation activity");
    }

    let message = message_view(stored);
    let delivered = ctx.hub.broadcast(
        conversation_id,
        &ServerEvent::NewMessage {
            message: message.clone(),
        },
    );
    info!(
        %conversation_id,
        %sender_id,
        message_id = %message.id,
        delivered,
        "message appended"
    );
    Ok(message)
}

/// Subscribes a live connection to a conversation it is allowed to read.
pub async fn join_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    connection: ConnectionId,
    conversation_id: ConversationId,
) -> Result<(), ApiError> {
    load_accessible_conversation(ctx, user_id, conversation_id).await?;
    if !ctx.hub.join(connection, conversation_id) {
        return Err(ApiError::not_found("connection closed"));
    }
    Ok(())
}

/// Typing state goes only to the other members of a group the sender joined;
/// it is never stored.
pub fn relay_typing(
    ctx: &ApiContext,
    connection: ConnectionId,
    user_id: UserId,
    conversation_id: ConversationId,
    is_typing: bool,
) -> Result<usize, ApiError> {
    if !ctx.hub.is_member(conversation_id, connection) {
        return Err(ApiError::forbidden(
            "join the conversation before sending typing updates",
        ));
    }
    Ok(ctx.hub.relay_typing(
        conversation_id,
        connection,
        &ServerEvent::UserTyping {
            conversation_id,
            user_id,
            is_typing,
        },
    ))
}

async fn load_accessible_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<StoredConversation, ApiError> {
    let conversation = ctx
        .storage
        .get_conversation(conversation_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("conversation not found"))?;
    if !authz::can_access_conversation(user_id, &conversation) {
        return Err(ApiError::forbidden("not a participant in this conversation"));
    }
    Ok(conversation)
}

fn conversation_record(conversation: StoredConversation) -> ConversationRecord {
    ConversationRecord {
        id: conversation.conversation_id,
        patient_id: conversation.patient_id,
        doctor_id: conversation.doctor_id,
        created_at: conversation.created_at,
        updated_at: conversation.updated_at,
    }
}

fn participant_summary(participant: StoredParticipant) -> ParticipantSummary {
    ParticipantSummary {
        id: participant.user_id,
        full_name: participant.full_name,
        email: participant.email,
    }
}

fn message_view(message: StoredMessage) -> MessageView {
    MessageView {
        id: message.message_id,
        conversation_id: message.conversation_id,
        content: message.content,
        created_at: message.created_at,
        sender: SenderSummary {
            id: message.sender_id,
            full_name: message.sender_full_name,
            role: message.sender_role,
        },
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    error!(error = %format!("{err:#}"), "storage operation failed");
    ApiError::new(ErrorCode::Internal, "storage failure")
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
