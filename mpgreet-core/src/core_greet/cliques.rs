//! CLIQUES group Diffie-Hellman key agreement
//!
//! Initial agreement runs an upflow chain: the member at position `k`
//! receives `k + 1` intermediate keys. It raises every entry except the last
//! one by its fresh private key, keeps the last entry and appends the last
//! entry raised by its key as the new cardinal value. The final member drops
//! the cardinal (which is its group secret) and broadcasts the remaining
//! list. Every member then raises the entry at its own position by all of its
//! private keys to reach the same secret.
//!
//! The auxiliary operations (join, exclude, refresh) let a single member mix
//! a new private key into every other member's entry before the list is
//! extended or broadcast.

use super::errors::{GreetError, GreetResult};
use crate::core_crypto::{scalar_mult, DhPoint, DhScalar};
use std::fmt;
use tracing::trace;

/// Whether a message belongs to the initial or an auxiliary agreement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Agreement {
    Initial,
    Auxiliary,
}

/// CLIQUES payload of a greet message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliquesMessage {
    pub source: String,
    /// Empty for a broadcast
    pub dest: String,
    pub agreement: Agreement,
    pub members: Vec<String>,
    pub int_keys: Vec<Option<DhPoint>>,
}

impl CliquesMessage {
    pub fn is_downflow(&self) -> bool {
        self.dest.is_empty()
    }
}

/// One member's view of the key agreement
#[derive(Clone)]
pub struct CliquesMember {
    id: String,
    members: Vec<String>,
    int_keys: Vec<Option<DhPoint>>,
    priv_keys: Vec<DhScalar>,
    group_secret: Option<DhPoint>,
}

impl fmt::Debug for CliquesMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CliquesMember")
            .field("id", &self.id)
            .field("members", &self.members)
            .field("priv_keys", &self.priv_keys.len())
            .field("has_group_secret", &self.group_secret.is_some())
            .finish()
    }
}

impl CliquesMember {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            members: Vec::new(),
            int_keys: Vec::new(),
            priv_keys: Vec::new(),
            group_secret: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn int_keys(&self) -> &[Option<DhPoint>] {
        &self.int_keys
    }

    /// Raw shared secret; only set once the current agreement has completed
    pub fn group_secret(&self) -> Option<&DhPoint> {
        self.group_secret.as_ref()
    }

    fn position(&self, members: &[String]) -> GreetResult<usize> {
        members
            .iter()
            .position(|m| *m == self.id)
            .ok_or_else(|| {
                GreetError::Decode(format!("{} is not a member of this agreement", self.id))
            })
    }

    /// Start an initial agreement with `others`
    ///
    /// # Errors
    ///
    /// Fails when `others` is empty or lists this member.
    pub fn ika(&mut self, others: &[String]) -> GreetResult<CliquesMessage> {
        if others.is_empty() {
            return Err(GreetError::Precondition("No members to start with.".to_string()));
        }
        if others.iter().any(|m| *m == self.id) {
            return Err(GreetError::Precondition("Cannot start a session with myself.".to_string()));
        }

        let mut members = Vec::with_capacity(others.len() + 1);
        members.push(self.id.clone());
        members.extend(others.iter().cloned());

        let start = CliquesMessage {
            source: self.id.clone(),
            dest: self.id.clone(),
            agreement: Agreement::Initial,
            members,
            int_keys: vec![None],
        };
        self.priv_keys.clear();
        self.group_secret = None;
        self.upflow(&start)
    }

    /// Process an upflow message addressed to this member
    ///
    /// Returns the next upflow message, or the broadcast if this member is
    /// last in the chain.
    pub fn upflow(&mut self, message: &CliquesMessage) -> GreetResult<CliquesMessage> {
        let pos = self.position(&message.members)?;
        if message.int_keys.len() != pos + 1 {
            return Err(GreetError::Decode(format!(
                "expected {} intermediate keys at position {}, got {}",
                pos + 1,
                pos,
                message.int_keys.len()
            )));
        }

        let key = DhScalar::generate();
        let cardinal = message.int_keys[pos];
        let mut int_keys: Vec<Option<DhPoint>> = message.int_keys[..pos]
            .iter()
            .map(|k| Some(scalar_mult(&key, k.as_ref())))
            .collect();
        int_keys.push(cardinal);
        let next_cardinal = scalar_mult(&key, cardinal.as_ref());

        self.priv_keys = vec![key];
        self.members = message.members.clone();

        if pos + 1 == self.members.len() {
            trace!("{} is last in the upflow chain, broadcasting", self.id);
            self.group_secret = Some(next_cardinal);
            self.int_keys = int_keys.clone();
            Ok(CliquesMessage {
                source: self.id.clone(),
                dest: String::new(),
                agreement: message.agreement,
                members: self.members.clone(),
                int_keys,
            })
        } else {
            int_keys.push(Some(next_cardinal));
            self.int_keys = int_keys.clone();
            Ok(CliquesMessage {
                source: self.id.clone(),
                dest: self.members[pos + 1].clone(),
                agreement: message.agreement,
                members: self.members.clone(),
                int_keys,
            })
        }
    }

    /// Process a broadcast and compute the group secret
    pub fn downflow(&mut self, message: &CliquesMessage) -> GreetResult<()> {
        let pos = self.position(&message.members)?;
        if message.int_keys.len() != message.members.len() {
            return Err(GreetError::Decode(format!(
                "expected {} intermediate keys, got {}",
                message.members.len(),
                message.int_keys.len()
            )));
        }
        if self.priv_keys.is_empty() {
            return Err(GreetError::Decode(format!(
                "{} has no private key contribution for this agreement",
                self.id
            )));
        }

        self.members = message.members.clone();
        self.int_keys = message.int_keys.clone();
        self.group_secret = Some(self.raise_own(pos)?);
        Ok(())
    }

    /// Raise the entry at `pos` by every private key held
    fn raise_own(&self, pos: usize) -> GreetResult<DhPoint> {
        let (first, rest) = self
            .priv_keys
            .split_first()
            .ok_or_else(|| GreetError::Internal(format!("{} holds no private key", self.id)))?;
        let entry = self
            .int_keys
            .get(pos)
            .ok_or_else(|| {
                GreetError::Internal(format!("no intermediate key at position {}", pos))
            })?;
        let mut point = scalar_mult(first, entry.as_ref());
        for key in rest {
            point = scalar_mult(key, Some(&point));
        }
        Ok(point)
    }

    /// Mix a fresh private key into every other member's entry
    fn renew_key(&mut self, pos: usize) -> DhScalar {
        let key = DhScalar::generate();
        for (i, entry) in self.int_keys.iter_mut().enumerate() {
            if i != pos {
                *entry = Some(scalar_mult(&key, entry.as_ref()));
            }
        }
        key
    }

    fn require_established(&self, operation: &'static str) -> GreetResult<(usize, DhPoint)> {
        let secret = self.group_secret.ok_or_else(|| GreetError::InvalidState {
            operation,
            state: "no established group key".to_string(),
        })?;
        Ok((self.position(&self.members)?, secret))
    }

    /// Start adding `new_members`, sending the upflow to the first of them
    pub fn aka_join(&mut self, new_members: &[String]) -> GreetResult<CliquesMessage> {
        if new_members.is_empty() {
            return Err(GreetError::Precondition("No members to add.".to_string()));
        }
        let (pos, secret) = self.require_established("join")?;
        if let Some(dup) = new_members.iter().find(|m| self.members.contains(m)) {
            return Err(GreetError::Precondition(format!("{} is already a member.", dup)));
        }

        let key = self.renew_key(pos);
        let cardinal = scalar_mult(&key, Some(&secret));
        self.priv_keys.push(key);
        self.group_secret = None;

        self.members.extend(new_members.iter().cloned());
        let mut int_keys = self.int_keys.clone();
        int_keys.push(Some(cardinal));

        Ok(CliquesMessage {
            source: self.id.clone(),
            dest: new_members[0].clone(),
            agreement: Agreement::Auxiliary,
            members: self.members.clone(),
            int_keys,
        })
    }

    /// Remove `excluded` and broadcast fresh intermediate keys
    pub fn aka_exclude(&mut self, excluded: &[String]) -> GreetResult<CliquesMessage> {
        if excluded.is_empty() {
            return Err(GreetError::Precondition("No members to exclude.".to_string()));
        }
        if excluded.iter().any(|m| *m == self.id) {
            return Err(GreetError::Precondition("Cannot exclude myself.".to_string()));
        }
        self.require_established("exclude")?;
        if let Some(unknown) = excluded.iter().find(|m| !self.members.contains(m)) {
            return Err(GreetError::Precondition(format!("{} is not a member.", unknown)));
        }

        let (members, int_keys): (Vec<_>, Vec<_>) = self
            .members
            .iter()
            .cloned()
            .zip(self.int_keys.iter().copied())
            .filter(|(m, _)| !excluded.contains(m))
            .unzip();
        self.members = members;
        self.int_keys = int_keys;

        self.renew_and_broadcast()
    }

    /// Broadcast fresh intermediate keys for the same membership
    pub fn aka_refresh(&mut self) -> GreetResult<CliquesMessage> {
        self.require_established("refresh")?;
        self.renew_and_broadcast()
    }

    fn renew_and_broadcast(&mut self) -> GreetResult<CliquesMessage> {
        let pos = self.position(&self.members)?;
        let key = self.renew_key(pos);
        self.priv_keys.push(key);
        self.group_secret = Some(self.raise_own(pos)?);

        Ok(CliquesMessage {
            source: self.id.clone(),
            dest: String::new(),
            agreement: Agreement::Auxiliary,
            members: self.members.clone(),
            int_keys: self.int_keys.clone(),
        })
    }

    /// Forget all key material
    pub fn aka_quit(&mut self) {
        self.priv_keys.clear();
        self.group_secret = None;
    }
}
