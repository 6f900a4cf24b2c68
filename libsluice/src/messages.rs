use crate::objective::ObjectiveId;
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Payload type of a rejection notice; its data is empty.
pub const REJECTION_NOTICE_PAYLOAD: &str = "RejectionNotice";

/// An opaque, typed blob addressed to one objective on the receiving node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectivePayload {
    pub objective_id: ObjectiveId,
    pub payload_type: String,
    #[serde(serialize_with = "crate::helpers::to_hex", deserialize_with = "crate::helpers::from_hex")]
    pub payload_data: Vec<u8>,
}

/// A point-to-point message to a counterparty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub to: Address,
    pub payload: ObjectivePayload,
}

/// Serializes `data` once and wraps it as one message per recipient.
pub fn create_objective_payload_messages<T: Serialize>(
    objective_id: ObjectiveId,
    data: &T,
    payload_type: &str,
    recipients: &[Address],
) -> Result<Vec<Message>, serde_json::Error> {
    let payload_data = serde_json::to_vec(data)?;
    Ok(recipients
        .iter()
        .map(|to| Message {
            to: *to,
            payload: ObjectivePayload {
                objective_id: objective_id.clone(),
                payload_type: payload_type.to_string(),
                payload_data: payload_data.clone(),
            },
        })
        .collect())
}

/// Notifies counterparties that we have rejected the objective.
pub fn create_rejection_notice_messages(objective_id: ObjectiveId, recipients: &[Address]) -> Vec<Message> {
    recipients
        .iter()
        .map(|to| Message {
            to: *to,
            payload: ObjectivePayload {
                objective_id: objective_id.clone(),
                payload_type: REJECTION_NOTICE_PAYLOAD.to_string(),
                payload_data: Vec::new(),
            },
        })
        .collect()
}

/// Delivery of signed objective payloads to a participant. Implementations
/// only promise eventual, at-least-once delivery; receivers must tolerate
/// duplicates and reordering.
pub trait MessageService: Send + Sync {
    fn send(&self, message: Message) -> impl Future<Output = Result<(), anyhow::Error>> + Send;
}
