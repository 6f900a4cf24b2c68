use crate::crypto::{CryptoError, Signature};
use crate::state::State;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum SignedStateError {
    #[error("The signature was not produced by any channel participant")]
    NotAParticipant,
    #[error("Conflicting signature for participant {0}")]
    ConflictingSignature(usize),
    #[error("No signature recorded for participant {0}")]
    MissingSignature(usize),
    #[error("Cannot merge signatures for different states")]
    StateMismatch,
    #[error("The record has {slots} signature slots for {participants} participants")]
    MalformedRecord { slots: usize, participants: usize },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// A state plus the signatures collected for it, one optional slot per
/// participant index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedState {
    state: State,
    signatures: Vec<Option<Signature>>,
}

impl SignedState {
    /// Wraps a state with no signatures collected yet.
    pub fn new(state: State) -> Self {
        let slots = state.fixed.participants.len();
        SignedState { state, signatures: vec![None; slots] }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Verifies the signature against the state hash and records it in the
    /// slot of the participant it recovers to. Recording the identical
    /// signature twice is a no-op; a different signature in an occupied slot
    /// is a protocol violation.
    pub fn add_signature(&mut self, signature: Signature) -> Result<(), SignedStateError> {
        let signer = signature.recover_signer(self.state.hash())?;
        let index = self
            .state
            .fixed
            .participants
            .iter()
            .position(|p| *p == signer)
            .ok_or(SignedStateError::NotAParticipant)?;
        match &self.signatures[index] {
            Some(existing) if *existing != signature => Err(SignedStateError::ConflictingSignature(index)),
            _ => {
                self.signatures[index] = Some(signature);
                Ok(())
            }
        }
    }

    pub fn has_signature_for(&self, participant_index: usize) -> bool {
        self.signatures.get(participant_index).is_some_and(|slot| slot.is_some())
    }

    /// True once every participant slot is populated.
    pub fn has_all_signatures(&self) -> bool {
        self.signatures.iter().all(|slot| slot.is_some())
    }

    pub fn participant_signature(&self, participant_index: usize) -> Result<Signature, SignedStateError> {
        self.signatures
            .get(participant_index)
            .copied()
            .flatten()
            .ok_or(SignedStateError::MissingSignature(participant_index))
    }

    /// The collected signatures in participant order, skipping empty slots.
    pub fn signatures(&self) -> Vec<Signature> {
        self.signatures.iter().filter_map(|slot| *slot).collect()
    }

    /// Checks that every recorded signature recovers to the participant
    /// whose slot it occupies. A freshly built record always passes; this
    /// guards records that arrived over the wire.
    pub fn verify(&self) -> Result<(), SignedStateError> {
        let participants = self.state.fixed.participants.len();
        if self.signatures.len() != participants {
            return Err(SignedStateError::MalformedRecord { slots: self.signatures.len(), participants });
        }
        let hash = self.state.hash();
        for (index, slot) in self.signatures.iter().enumerate() {
            if let Some(signature) = slot {
                let signer = signature.recover_signer(hash)?;
                if signer != self.state.fixed.participants[index] {
                    return Err(SignedStateError::ConflictingSignature(index));
                }
            }
        }
        Ok(())
    }

    /// Merges another record for the same round into this one: the result
    /// holds the union of both signature sets. Fails without mutating if the
    /// states differ or any shared slot holds conflicting content.
    pub fn merge(&mut self, other: &SignedState) -> Result<(), SignedStateError> {
        if other.state.hash() != self.state.hash() {
            return Err(SignedStateError::StateMismatch);
        }
        if other.signatures.len() != self.signatures.len() {
            return Err(SignedStateError::MalformedRecord {
                slots: other.signatures.len(),
                participants: self.signatures.len(),
            });
        }
        for (index, (mine, theirs)) in self.signatures.iter().zip(&other.signatures).enumerate() {
            if let (Some(a), Some(b)) = (mine, theirs) {
                if a != b {
                    return Err(SignedStateError::ConflictingSignature(index));
                }
            }
        }
        for (mine, theirs) in self.signatures.iter_mut().zip(&other.signatures) {
            if mine.is_none() {
                *mine = *theirs;
            }
        }
        Ok(())
    }
}
