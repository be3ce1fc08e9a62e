//! Directory of long-term member public keys

use super::errors::{GreetError, GreetResult};
use crate::core_crypto::GreetVerifyingKey;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Helper to convert poison errors into GreetError
fn handle_poison<T>(_err: PoisonError<T>) -> GreetError {
    GreetError::Internal("Lock poisoned: a thread panicked while holding the lock".to_string())
}

/// Lookup of a member's long-term signing public key
pub trait PubKeyDirectory: Send + Sync {
    /// Returns `None` when the member is not known
    fn lookup(&self, member: &str) -> GreetResult<Option<GreetVerifyingKey>>;

    /// Like `lookup`, but an unknown member is an error
    fn require(&self, member: &str) -> GreetResult<GreetVerifyingKey> {
        self.lookup(member)?
            .ok_or_else(|| GreetError::UnknownMember(member.to_string()))
    }
}

/// In-memory directory, shared between the participants of a simulation
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    keys: Arc<RwLock<HashMap<String, GreetVerifyingKey>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a member's key
    pub fn insert(&self, member: impl Into<String>, key: GreetVerifyingKey) -> GreetResult<()> {
        self.keys.write().map_err(handle_poison)?.insert(member.into(), key);
        Ok(())
    }

    pub fn len(&self) -> GreetResult<usize> {
        Ok(self.keys.read().map_err(handle_poison)?.len())
    }
}

impl PubKeyDirectory for MemoryDirectory {
    fn lookup(&self, member: &str) -> GreetResult<Option<GreetVerifyingKey>> {
        Ok(self.keys.read().map_err(handle_poison)?.get(member).cloned())
    }
}
