use crate::crypto::{CryptoError, SecretKey, Signature};
use crate::outcome::Exit;
use crate::types::Destination;
use alloy_primitives::{keccak256, Address, B256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum StateError {
    #[error("A channel requires at least two participants")]
    TooFewParticipants,
    #[error("Participant {0} appears more than once")]
    DuplicateParticipant(Address),
    #[error("Could not sign the state: {0}")]
    Signing(#[from] CryptoError),
}

/// The immutable parameters of a channel. Together they determine the
/// channel's id, so changing any of them creates a different channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedPart {
    /// Participant signing addresses. A participant's position in this list
    /// is its signing identity for the lifetime of the channel.
    pub participants: Vec<Address>,
    /// Disambiguates channels between the same participants.
    pub channel_nonce: u64,
    /// The application contract governing state transitions.
    pub app_definition: Address,
    /// Seconds a registered challenge stays open before finalizing.
    pub challenge_duration: u32,
}

impl FixedPart {
    pub fn validate(&self) -> Result<(), StateError> {
        if self.participants.len() < 2 {
            return Err(StateError::TooFewParticipants);
        }
        for (i, p) in self.participants.iter().enumerate() {
            if self.participants[..i].contains(p) {
                return Err(StateError::DuplicateParticipant(*p));
            }
        }
        Ok(())
    }

    /// The channel's deterministic identifier: a hash over the fixed
    /// parameters, in order.
    pub fn channel_id(&self) -> Destination {
        let mut hasher = FieldHasher::new(b"sluice channel id v1");
        hasher.field(b"participants", &encode_addresses(&self.participants));
        hasher.field(b"channel_nonce", &self.channel_nonce.to_be_bytes());
        hasher.field(b"app_definition", self.app_definition.as_slice());
        hasher.field(b"challenge_duration", &self.challenge_duration.to_be_bytes());
        Destination(hasher.finalize())
    }
}

/// The parts of a state that change from round to round.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariablePart {
    #[serde(serialize_with = "crate::helpers::to_hex", deserialize_with = "crate::helpers::from_hex")]
    pub app_data: Vec<u8>,
    pub outcome: Exit,
    pub turn_num: u64,
    pub is_final: bool,
}

/// A turn-numbered state proposal for a channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub fixed: FixedPart,
    pub variable: VariablePart,
}

impl State {
    pub fn validate(&self) -> Result<(), StateError> {
        self.fixed.validate()
    }

    pub fn channel_id(&self) -> Destination {
        self.fixed.channel_id()
    }

    pub fn turn_num(&self) -> u64 {
        self.variable.turn_num
    }

    pub fn is_final(&self) -> bool {
        self.variable.is_final
    }

    /// The hash participants sign: a commitment to the channel id and the
    /// full variable part.
    pub fn hash(&self) -> B256 {
        let mut hasher = FieldHasher::new(b"sluice state v1");
        hasher.field(b"channel_id", self.channel_id().as_bytes());
        hasher.field(b"app_data", &self.variable.app_data);
        hasher.field(b"outcome", &encode_exit(&self.variable.outcome));
        hasher.field(b"turn_num", &self.variable.turn_num.to_be_bytes());
        hasher.field(b"is_final", &[self.variable.is_final as u8]);
        hasher.finalize()
    }

    /// The hash signed by a challenger to authorize a challenge with this
    /// state, domain-separated from the ordinary state signature.
    pub fn challenge_hash(&self) -> B256 {
        let mut hasher = FieldHasher::new(b"sluice forced move v1");
        hasher.field(b"state_hash", self.hash().as_slice());
        hasher.finalize()
    }

    pub fn sign(&self, key: &SecretKey) -> Result<Signature, StateError> {
        Ok(key.sign_hash(self.hash())?)
    }

    /// Reassembles a state observed on chain from the channel's fixed part
    /// and the disputed variable part.
    pub fn from_parts(fixed: &FixedPart, variable: &VariablePart) -> State {
        State { fixed: fixed.clone(), variable: variable.clone() }
    }

    /// A copy of this state with a different turn number, used to derive the
    /// post-fund round from the pre-fund round.
    pub fn with_turn_num(&self, turn_num: u64) -> State {
        let mut next = self.clone();
        next.variable.turn_num = turn_num;
        next
    }
}

/// Accumulates length-prefixed labelled fields into a single keccak256.
/// Length prefixes keep distinct field sequences from colliding.
struct FieldHasher {
    buf: Vec<u8>,
}

impl FieldHasher {
    fn new(domain: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&(domain.len() as u32).to_be_bytes());
        buf.extend_from_slice(domain);
        FieldHasher { buf }
    }

    fn field(&mut self, label: &[u8], data: &[u8]) {
        self.buf.extend_from_slice(&(label.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(label);
        self.buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(data);
    }

    fn finalize(self) -> B256 {
        keccak256(&self.buf)
    }
}

fn encode_addresses(addresses: &[Address]) -> Vec<u8> {
    let mut out = Vec::with_capacity(addresses.len() * 20);
    for a in addresses {
        out.extend_from_slice(a.as_slice());
    }
    out
}

/// Canonical byte encoding of an outcome for hashing purposes.
fn encode_exit(exit: &Exit) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(exit.0.len() as u32).to_be_bytes());
    for sae in &exit.0 {
        out.extend_from_slice(sae.asset.as_slice());
        out.extend_from_slice(&(sae.metadata.len() as u32).to_be_bytes());
        out.extend_from_slice(&sae.metadata);
        out.extend_from_slice(&(sae.allocations.len() as u32).to_be_bytes());
        for allocation in &sae.allocations {
            out.extend_from_slice(allocation.destination.as_bytes());
            out.extend_from_slice(&allocation.amount.to_be_bytes::<32>());
            out.push(allocation.allocation_type as u8);
            out.extend_from_slice(&(allocation.metadata.len() as u32).to_be_bytes());
            out.extend_from_slice(&allocation.metadata);
        }
    }
    out
}
