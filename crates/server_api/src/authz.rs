//! Who may open and use a conversation. Every entry point, request or live
//! event, goes through these two checks and nothing else.

use shared::{
    domain::{Role, UserId},
    error::ApiError,
};
use storage::StoredConversation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticipantPair {
    pub patient_id: UserId,
    pub doctor_id: UserId,
}

/// Either side of the pairing may start a conversation: a patient names a
/// doctor, a doctor names a patient.
pub fn can_create_conversation(
    requester_role: Role,
    requester_id: UserId,
    counterpart_id: Option<UserId>,
) -> Result<ParticipantPair, ApiError> {
    let counterpart_field = match requester_role {
        Role::Patient => "doctor_id",
        Role::Doctor => "patient_id",
        Role::MedicineCompany => {
            return Err(ApiError::forbidden(
                "only patients and doctors can start conversations",
            ))
        }
    };

    let counterpart_id = counterpart_id
        .ok_or_else(|| ApiError::validation(format!("{counterpart_field} is required")))?;
    if counterpart_id == requester_id {
        return Err(ApiError::validation(
            "cannot start a conversation with yourself",
        ));
    }

    Ok(if requester_role == Role::Patient {
        ParticipantPair {
            patient_id: requester_id,
            doctor_id: counterpart_id,
        }
    } else {
        ParticipantPair {
            patient_id: counterpart_id,
            doctor_id: requester_id,
        }
    })
}

pub fn can_access_conversation(user_id: UserId, conversation: &StoredConversation) -> bool {
    user_id == conversation.patient_id || user_id == conversation.doctor_id
}
