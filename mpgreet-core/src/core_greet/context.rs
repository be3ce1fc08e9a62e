//! Identity and collaborators shared by all greetings of one member

use super::directory::PubKeyDirectory;
use crate::core_crypto::GreetSigningKey;
use std::fmt;
use std::sync::Arc;

/// Everything a greeting needs that outlives a single operation
pub struct GreetContext {
    pub id: String,
    /// Long-term signing key; signs packets and session confirmations
    pub signing_key: Arc<GreetSigningKey>,
    pub directory: Arc<dyn PubKeyDirectory>,
    /// Degrade illegal greet type transitions to a warning
    pub silence_illegal_types: bool,
}

impl GreetContext {
    pub fn new(
        id: impl Into<String>,
        signing_key: GreetSigningKey,
        directory: Arc<dyn PubKeyDirectory>,
    ) -> Self {
        Self {
            id: id.into(),
            signing_key: Arc::new(signing_key),
            directory,
            silence_illegal_types: false,
        }
    }

    pub fn with_silence_illegal_types(mut self, silence: bool) -> Self {
        self.silence_illegal_types = silence;
        self
    }
}

impl fmt::Debug for GreetContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GreetContext")
            .field("id", &self.id)
            .field("silence_illegal_types", &self.silence_illegal_types)
            .finish()
    }
}
