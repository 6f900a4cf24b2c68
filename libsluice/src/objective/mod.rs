//! The generic state-machine contract every multi-party protocol satisfies:
//! approve/reject/update transitions and a crank that inspects the current
//! state and declares side effects for the engine to perform.

pub mod direct_defund;
pub mod direct_fund;

pub use direct_defund::DirectDefundObjective;
pub use direct_fund::DirectFundObjective;

use crate::chain::{ChainEvent, ChainTransaction};
use crate::channel::{Channel, ChannelError};
use crate::crypto::{CryptoError, SecretKey};
use crate::messages::{Message, ObjectivePayload};
use crate::state::StateError;
use crate::types::Destination;
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum ObjectiveError {
    #[error("Objective not approved")]
    NotApproved,
    #[error("Payload is for objective {got}, expected {expected}")]
    WrongObjective { expected: ObjectiveId, got: ObjectiveId },
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("The payload does not contain a signed state")]
    MissingSignatures,
    #[error("Expected a final state")]
    NonFinalState,
    #[error("Expected a state with turn number {expected}, received {got}")]
    UnexpectedTurnNum { expected: u64, got: u64 },
    #[error("Can only defund a channel when the latest state is supported or final")]
    ChannelUpdateInProgress,
    #[error("{0} is not a participant of the channel")]
    NotAParticipant(Address),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl From<serde_json::Error> for ObjectiveError {
    fn from(e: serde_json::Error) -> Self {
        ObjectiveError::MalformedPayload(e.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveStatus {
    Unapproved,
    Approved,
    Rejected,
    Completed,
}

/// A unique identifier for an objective: a protocol prefix followed by the
/// owned channel's id. The prefix doubles as the dispatch tag when an id
/// arrives over the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectiveId(pub String);

impl ObjectiveId {
    pub fn for_channel(prefix: &str, channel_id: Destination) -> ObjectiveId {
        ObjectiveId(format!("{prefix}{channel_id}"))
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl Display for ObjectiveId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An enumerable pause-point: what external input would let a crank make
/// further progress. Used for liveness diagnostics and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitingFor(pub &'static str);

impl Display for WaitingFor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A consensus proposal to be routed to the ledger-channel machinery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedProposal {
    pub objective_id: ObjectiveId,
    #[serde(serialize_with = "crate::helpers::to_hex", deserialize_with = "crate::helpers::from_hex")]
    pub data: Vec<u8>,
}

/// Declarative output of a crank step, executed by the engine: the objective
/// decides *what* should happen, never performs it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SideEffects {
    pub messages_to_send: Vec<Message>,
    pub transactions_to_submit: Vec<ChainTransaction>,
    pub proposals_to_process: Vec<SignedProposal>,
}

impl SideEffects {
    pub fn is_empty(&self) -> bool {
        self.messages_to_send.is_empty()
            && self.transactions_to_submit.is_empty()
            && self.proposals_to_process.is_empty()
    }

    pub fn merge(&mut self, other: SideEffects) {
        self.messages_to_send.extend(other.messages_to_send);
        self.transactions_to_submit.extend(other.transactions_to_submit);
        self.proposals_to_process.extend(other.proposals_to_process);
    }
}

/// A protocol instance. One variant per protocol; the engine dispatches on
/// the variant exhaustively and the serialized form is self-describing.
///
/// Every transition returns a new value and leaves the receiver untouched,
/// so callers keep the old objective for comparison and for discarding a
/// failed transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Objective {
    DirectFund(DirectFundObjective),
    DirectDefund(DirectDefundObjective),
}

impl Objective {
    pub fn id(&self) -> ObjectiveId {
        match self {
            Objective::DirectFund(o) => o.id(),
            Objective::DirectDefund(o) => o.id(),
        }
    }

    pub fn status(&self) -> ObjectiveStatus {
        match self {
            Objective::DirectFund(o) => o.status,
            Objective::DirectDefund(o) => o.status,
        }
    }

    /// The channel this objective exclusively owns while approved.
    pub fn owns_channel(&self) -> Destination {
        match self {
            Objective::DirectFund(o) => o.c.id,
            Objective::DirectDefund(o) => o.c.id,
        }
    }

    /// Channels that must be co-persisted with the objective.
    pub fn related(&self) -> Vec<&Channel> {
        match self {
            Objective::DirectFund(o) => vec![&o.c],
            Objective::DirectDefund(o) => vec![&o.c],
        }
    }

    pub fn approve(&self) -> Objective {
        match self {
            Objective::DirectFund(o) => Objective::DirectFund(o.approve()),
            Objective::DirectDefund(o) => Objective::DirectDefund(o.approve()),
        }
    }

    pub fn reject(&self) -> (Objective, SideEffects) {
        match self {
            Objective::DirectFund(o) => {
                let (updated, effects) = o.reject();
                (Objective::DirectFund(updated), effects)
            }
            Objective::DirectDefund(o) => {
                let (updated, effects) = o.reject();
                (Objective::DirectDefund(updated), effects)
            }
        }
    }

    /// Merges inbound peer data into the objective's owned channel.
    pub fn update(&self, payload: &ObjectivePayload) -> Result<Objective, ObjectiveError> {
        match self {
            Objective::DirectFund(o) => Ok(Objective::DirectFund(o.update(payload)?)),
            Objective::DirectDefund(o) => Ok(Objective::DirectDefund(o.update(payload)?)),
        }
    }

    /// Applies a confirmed chain event to the owned channel, recomputing the
    /// channel mode against the event's block timestamp.
    pub fn update_with_chain_event(&self, event: &ChainEvent) -> Result<Objective, ObjectiveError> {
        let mut updated = self.clone();
        let channel = match &mut updated {
            Objective::DirectFund(o) => &mut o.c,
            Objective::DirectDefund(o) => &mut o.c,
        };
        channel.update_with_chain_event(event)?;
        channel.update_channel_mode(event.block.timestamp);
        Ok(updated)
    }

    /// Advances the protocol one step: inspects the current state and
    /// declares the side effects that would make progress. Idempotent under
    /// repeated invocation with unchanged inputs.
    pub fn crank(&self, key: &SecretKey) -> Result<(Objective, SideEffects, WaitingFor), ObjectiveError> {
        match self {
            Objective::DirectFund(o) => {
                let (updated, effects, waiting_for) = o.crank(key)?;
                Ok((Objective::DirectFund(updated), effects, waiting_for))
            }
            Objective::DirectDefund(o) => {
                let (updated, effects, waiting_for) = o.crank(key)?;
                Ok((Objective::DirectDefund(updated), effects, waiting_for))
            }
        }
    }
}
