//! Snapshot of a completed greeting

use super::aske::AskeMember;
use super::cliques::CliquesMember;
use super::errors::{GreetError, GreetResult};
use crate::core_crypto::{derive_group_key, Digest};
use std::collections::BTreeSet;
use std::fmt;

/// Protocol state of a greeting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GreetingState {
    Null,
    InitUpflow,
    InitDownflow,
    Ready,
    AuxUpflow,
    AuxDownflow,
    Quit,
}

impl GreetingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GreetingState::Null => "NULL",
            GreetingState::InitUpflow => "INIT_UPFLOW",
            GreetingState::InitDownflow => "INIT_DOWNFLOW",
            GreetingState::Ready => "READY",
            GreetingState::AuxUpflow => "AUX_UPFLOW",
            GreetingState::AuxDownflow => "AUX_DOWNFLOW",
            GreetingState::Quit => "QUIT",
        }
    }
}

impl fmt::Display for GreetingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key material and membership left behind by a completed operation
///
/// The next operation starts from a store; it is never mutated itself.
#[derive(Debug, Clone)]
pub struct GreetStore {
    id: String,
    state: GreetingState,
    cliques: CliquesMember,
    aske: AskeMember,
}

impl GreetStore {
    pub(crate) fn new(
        id: String,
        state: GreetingState,
        cliques: CliquesMember,
        aske: AskeMember,
    ) -> Self {
        Self { id, state, cliques, aske }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> GreetingState {
        self.state
    }

    /// Members in protocol order
    pub fn members(&self) -> &[String] {
        self.cliques.members()
    }

    pub fn member_set(&self) -> BTreeSet<String> {
        self.members().iter().cloned().collect()
    }

    pub fn session_id(&self) -> Option<&Digest> {
        self.aske.session_id()
    }

    pub fn ephemeral_pub_key(&self, member: &str) -> Option<&[u8; 32]> {
        self.aske.ephemeral_pub_key(member)
    }

    /// Symmetric key derived from the shared group secret
    ///
    /// # Errors
    ///
    /// Fails if no group secret has been agreed.
    pub fn group_key(&self) -> GreetResult<[u8; 32]> {
        let secret = self.cliques.group_secret().ok_or_else(|| GreetError::InvalidState {
            operation: "group_key",
            state: self.state.to_string(),
        })?;
        Ok(derive_group_key(secret)?)
    }

    pub(crate) fn cliques(&self) -> &CliquesMember {
        &self.cliques
    }

    pub(crate) fn aske(&self) -> &AskeMember {
        &self.aske
    }
}
