//! Authenticated signature key exchange
//!
//! Each member contributes a random nonce and an ephemeral signing key. The
//! session id is the hash of the member list and all nonces. Every member
//! signs its ephemeral key, its nonce and the session id with its long-term
//! key; once a member has verified a signature from everyone, the session is
//! acknowledged.

use super::directory::PubKeyDirectory;
use super::errors::{GreetError, GreetResult};
use super::message::Nonce;
use crate::core_crypto::{sha256_parts, Digest, GreetSigningKey, GreetVerifyingKey};
use rand::RngCore;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

const SESSION_ID_TAG: &[u8] = b"mpgreet session id";
const AUTH_DATA_TAG: &[u8] = b"mpgreet session auth";

/// ASKE payload of a greet message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskeMessage {
    pub source: String,
    /// Empty for a broadcast
    pub dest: String,
    pub members: Vec<String>,
    pub nonces: Vec<Nonce>,
    pub pub_keys: Vec<[u8; 32]>,
    pub session_signature: Option<Vec<u8>>,
    pub signing_key: Option<[u8; 32]>,
}

impl AskeMessage {
    fn broadcast(source: &str) -> Self {
        Self {
            source: source.to_string(),
            dest: String::new(),
            members: Vec::new(),
            nonces: Vec::new(),
            pub_keys: Vec::new(),
            session_signature: None,
            signing_key: None,
        }
    }

    pub fn is_downflow(&self) -> bool {
        self.dest.is_empty()
    }
}

/// Hash of the member list and the nonces, identifying one session
pub fn session_id(members: &[String], nonces: &[Nonce]) -> Digest {
    let parts = std::iter::once(SESSION_ID_TAG)
        .chain(members.iter().map(|m| m.as_bytes()))
        .chain(nonces.iter().map(|n| n.as_slice()));
    sha256_parts(parts)
}

fn auth_data(member: &str, pub_key: &[u8; 32], nonce: &Nonce, sid: &Digest) -> Digest {
    sha256_parts([
        AUTH_DATA_TAG,
        member.as_bytes(),
        pub_key.as_slice(),
        nonce.as_slice(),
        sid.as_slice(),
    ])
}

/// One member's view of the key exchange
#[derive(Clone)]
pub struct AskeMember {
    id: String,
    static_key: Arc<GreetSigningKey>,
    directory: Arc<dyn PubKeyDirectory>,
    members: Vec<String>,
    nonce: Option<Nonce>,
    ephemeral_key: Option<GreetSigningKey>,
    nonces: Vec<Nonce>,
    ephemeral_pub_keys: Vec<[u8; 32]>,
    session_id: Option<Digest>,
    authenticated: BTreeSet<String>,
    revealed_keys: BTreeMap<String, [u8; 32]>,
}

impl fmt::Debug for AskeMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AskeMember")
            .field("id", &self.id)
            .field("members", &self.members)
            .field("session_id", &self.session_id.map(hex::encode))
            .field("authenticated", &self.authenticated)
            .finish()
    }
}

impl AskeMember {
    pub fn new(
        id: impl Into<String>,
        static_key: Arc<GreetSigningKey>,
        directory: Arc<dyn PubKeyDirectory>,
    ) -> Self {
        Self {
            id: id.into(),
            static_key,
            directory,
            members: Vec::new(),
            nonce: None,
            ephemeral_key: None,
            nonces: Vec::new(),
            ephemeral_pub_keys: Vec::new(),
            session_id: None,
            authenticated: BTreeSet::new(),
            revealed_keys: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn session_id(&self) -> Option<&Digest> {
        self.session_id.as_ref()
    }

    /// Ephemeral signing public key of `member` in the current session
    pub fn ephemeral_pub_key(&self, member: &str) -> Option<&[u8; 32]> {
        let pos = self.members.iter().position(|m| m == member)?;
        self.ephemeral_pub_keys.get(pos)
    }

    /// Ephemeral secret a departed member disclosed when quitting
    pub fn revealed_key(&self, member: &str) -> Option<&[u8; 32]> {
        self.revealed_keys.get(member)
    }

    /// Whether every member's session signature has been verified
    pub fn is_session_acknowledged(&self) -> bool {
        !self.members.is_empty() && self.members.iter().all(|m| self.authenticated.contains(m))
    }

    /// Members whose session signature is still outstanding
    pub fn yet_to_authenticate(&self) -> BTreeSet<String> {
        self.members
            .iter()
            .filter(|m| !self.authenticated.contains(*m))
            .cloned()
            .collect()
    }

    /// Forget which members have confirmed, ahead of a new operation
    pub fn reset_authentication(&mut self) {
        self.authenticated.clear();
    }

    fn fresh_contribution(&mut self) -> (Nonce, [u8; 32]) {
        let mut nonce = [0u8; 32];
        rand::rng().fill_bytes(&mut nonce);
        let key = GreetSigningKey::generate();
        let pub_key = key.verifying_key().to_bytes();
        self.nonce = Some(nonce);
        self.ephemeral_key = Some(key);
        (nonce, pub_key)
    }

    /// Start a new session with `others`
    pub fn commit(&mut self, others: &[String]) -> GreetResult<AskeMessage> {
        if others.is_empty() {
            return Err(GreetError::Precondition("No members to start with.".to_string()));
        }
        let (nonce, pub_key) = self.fresh_contribution();

        self.members = std::iter::once(self.id.clone()).chain(others.iter().cloned()).collect();
        self.nonces = vec![nonce];
        self.ephemeral_pub_keys = vec![pub_key];
        self.session_id = None;
        self.authenticated.clear();

        Ok(AskeMessage {
            source: self.id.clone(),
            dest: self.members[1].clone(),
            members: self.members.clone(),
            nonces: self.nonces.clone(),
            pub_keys: self.ephemeral_pub_keys.clone(),
            session_signature: None,
            signing_key: None,
        })
    }

    /// Add our contribution to an upflow message
    ///
    /// The last member of the chain derives the session id and broadcasts
    /// its session signature.
    pub fn upflow(&mut self, message: &AskeMessage) -> GreetResult<AskeMessage> {
        let pos = message
            .members
            .iter()
            .position(|m| *m == self.id)
            .ok_or_else(|| {
                GreetError::Decode(format!("{} is not a member of this session", self.id))
            })?;
        if message.nonces.len() != pos || message.pub_keys.len() != pos {
            return Err(GreetError::Decode(format!(
                "expected {} nonces and ephemeral keys at position {}",
                pos, pos
            )));
        }

        let (nonce, pub_key) = self.fresh_contribution();
        self.members = message.members.clone();
        self.nonces = message.nonces.clone();
        self.nonces.push(nonce);
        self.ephemeral_pub_keys = message.pub_keys.clone();
        self.ephemeral_pub_keys.push(pub_key);
        self.authenticated.clear();

        if pos + 1 == self.members.len() {
            let sid = session_id(&self.members, &self.nonces);
            self.session_id = Some(sid);
            let signature = self.sign_session(&sid, &nonce, &pub_key);
            Ok(self.contribution_message(signature))
        } else {
            Ok(AskeMessage {
                source: self.id.clone(),
                dest: self.members[pos + 1].clone(),
                members: self.members.clone(),
                nonces: self.nonces.clone(),
                pub_keys: self.ephemeral_pub_keys.clone(),
                session_signature: None,
                signing_key: None,
            })
        }
    }

    fn sign_session(&mut self, sid: &Digest, nonce: &Nonce, pub_key: &[u8; 32]) -> Vec<u8> {
        let data = auth_data(&self.id, pub_key, nonce, sid);
        self.authenticated.insert(self.id.clone());
        self.static_key.sign(&data)
    }

    fn contribution_message(&self, signature: Vec<u8>) -> AskeMessage {
        AskeMessage {
            members: self.members.clone(),
            nonces: self.nonces.clone(),
            pub_keys: self.ephemeral_pub_keys.clone(),
            session_signature: Some(signature),
            ..AskeMessage::broadcast(&self.id)
        }
    }

    fn own_contribution(&self) -> GreetResult<(Nonce, [u8; 32])> {
        match (&self.nonce, &self.ephemeral_key) {
            (Some(nonce), Some(key)) => Ok((*nonce, key.verifying_key().to_bytes())),
            _ => Err(GreetError::InvalidState {
                operation: "authenticate",
                state: "no session contribution".to_string(),
            }),
        }
    }

    /// Verify a broadcast and, if we have not signed yet, reply with our
    /// own session signature
    ///
    /// # Errors
    ///
    /// Returns [`GreetError::SessionAuthFailed`] when the sender's signature
    /// does not verify or when the broadcast dropped our contribution.
    pub fn downflow(&mut self, message: &AskeMessage) -> GreetResult<Option<AskeMessage>> {
        let Some(signature) = message.session_signature.as_ref() else {
            debug!("ASKE broadcast from {} carries no session signature", message.source);
            return Ok(None);
        };

        if message.members.len() != message.nonces.len()
            || message.members.len() != message.pub_keys.len()
        {
            return Err(GreetError::Decode(format!(
                "session broadcast from {} has {} members but {} nonces and {} keys",
                message.source,
                message.members.len(),
                message.nonces.len(),
                message.pub_keys.len()
            )));
        }

        let sid = session_id(&message.members, &message.nonces);
        if self.session_id != Some(sid) {
            let (nonce, pub_key) = self.own_contribution()?;
            let pos = message.members.iter().position(|m| *m == self.id);
            let unchanged =
                pos.is_some_and(|p| message.nonces[p] == nonce && message.pub_keys[p] == pub_key);
            if !unchanged {
                warn!(
                    "Session broadcast from {} altered the contribution of {}",
                    message.source, self.id
                );
                return Err(GreetError::SessionAuthFailed(message.source.clone()));
            }
            self.members = message.members.clone();
            self.nonces = message.nonces.clone();
            self.ephemeral_pub_keys = message.pub_keys.clone();
            self.session_id = Some(sid);
            self.authenticated.clear();
        }

        self.verify_member(&message.source, signature, &sid)?;

        if self.authenticated.contains(&self.id) {
            return Ok(None);
        }
        let (nonce, pub_key) = self.own_contribution()?;
        let signature = self.sign_session(&sid, &nonce, &pub_key);
        Ok(Some(self.contribution_message(signature)))
    }

    fn verify_member(&mut self, member: &str, signature: &[u8], sid: &Digest) -> GreetResult<()> {
        let pos = self
            .members
            .iter()
            .position(|m| m == member)
            .ok_or_else(|| GreetError::SessionAuthFailed(member.to_string()))?;
        let static_pub: GreetVerifyingKey = self.directory.require(member)?;
        let data = auth_data(member, &self.ephemeral_pub_keys[pos], &self.nonces[pos], sid);
        match static_pub.verify(&data, signature) {
            Ok(true) => {
                self.authenticated.insert(member.to_string());
                Ok(())
            }
            Ok(false) | Err(_) => Err(GreetError::SessionAuthFailed(member.to_string())),
        }
    }

    fn require_session(&self, operation: &'static str) -> GreetResult<()> {
        if self.session_id.is_none() {
            return Err(GreetError::InvalidState {
                operation,
                state: "no established session".to_string(),
            });
        }
        Ok(())
    }

    /// Extend the session with `new_members`, sending the upflow to the
    /// first of them
    pub fn join(&mut self, new_members: &[String]) -> GreetResult<AskeMessage> {
        if new_members.is_empty() {
            return Err(GreetError::Precondition("No members to add.".to_string()));
        }
        self.require_session("join")?;

        self.members.extend(new_members.iter().cloned());
        self.authenticated.clear();
        Ok(AskeMessage {
            source: self.id.clone(),
            dest: new_members[0].clone(),
            members: self.members.clone(),
            nonces: self.nonces.clone(),
            pub_keys: self.ephemeral_pub_keys.clone(),
            session_signature: None,
            signing_key: None,
        })
    }

    /// Remove `excluded` and broadcast a signature over the new session id
    pub fn exclude(&mut self, excluded: &[String]) -> GreetResult<AskeMessage> {
        if excluded.is_empty() {
            return Err(GreetError::Precondition("No members to exclude.".to_string()));
        }
        if excluded.iter().any(|m| *m == self.id) {
            return Err(GreetError::Precondition("Cannot exclude myself.".to_string()));
        }
        self.require_session("exclude")?;

        let keep: Vec<bool> = self.members.iter().map(|m| !excluded.contains(m)).collect();
        let mut it = keep.iter();
        self.members.retain(|_| *it.next().unwrap_or(&true));
        let mut it = keep.iter();
        self.nonces.retain(|_| *it.next().unwrap_or(&true));
        let mut it = keep.iter();
        self.ephemeral_pub_keys.retain(|_| *it.next().unwrap_or(&true));

        let sid = session_id(&self.members, &self.nonces);
        self.session_id = Some(sid);
        self.authenticated.clear();
        let (nonce, pub_key) = self.own_contribution()?;
        let signature = self.sign_session(&sid, &nonce, &pub_key);
        Ok(self.contribution_message(signature))
    }

    /// Leave the session, disclosing our ephemeral signing key
    pub fn quit(&mut self) -> GreetResult<AskeMessage> {
        let key = self.ephemeral_key.take().ok_or_else(|| GreetError::InvalidState {
            operation: "quit",
            state: "no ephemeral signing key".to_string(),
        })?;
        Ok(AskeMessage {
            signing_key: Some(key.to_bytes()),
            ..AskeMessage::broadcast(&self.id)
        })
    }

    /// Record the ephemeral key a departing member disclosed
    pub fn record_quit(&mut self, member: &str, signing_key: Option<[u8; 32]>) {
        if let Some(key) = signing_key {
            self.revealed_keys.insert(member.to_string(), key);
        }
        self.authenticated.remove(member);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_greet::directory::MemoryDirectory;

    fn names(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn parties(ids: &[&str]) -> Vec<AskeMember> {
        let directory = MemoryDirectory::new();
        let keys: Vec<Arc<GreetSigningKey>> = ids
            .iter()
            .map(|id| {
                let key = GreetSigningKey::generate();
                directory.insert(*id, key.verifying_key()).unwrap();
                Arc::new(key)
            })
            .collect();
        let directory: Arc<dyn PubKeyDirectory> = Arc::new(directory);
        ids.iter()
            .zip(keys)
            .map(|(id, key)| AskeMember::new(*id, key, directory.clone()))
            .collect()
    }

    /// Deliver every broadcast to everyone else until nothing is left
    fn flood(parties: &mut [AskeMember], first: AskeMessage) {
        let mut queue = vec![first];
        while let Some(msg) = queue.pop() {
            for party in parties.iter_mut() {
                if party.id() == msg.source || !msg.members.contains(&party.id().to_string()) {
                    continue;
                }
                if let Some(reply) = party.downflow(&msg).unwrap() {
                    queue.push(reply);
                }
            }
        }
    }

    fn run_commit(parties: &mut [AskeMember]) {
        let others: Vec<String> = parties[1..].iter().map(|p| p.id().to_string()).collect();
        let mut msg = parties[0].commit(&others).unwrap();
        for party in parties.iter_mut().skip(1) {
            msg = party.upflow(&msg).unwrap();
        }
        assert!(msg.is_downflow());
        flood(parties, msg);
    }

    #[test]
    fn test_full_session() {
        let mut ps = parties(&["1", "2", "3", "4"]);
        run_commit(&mut ps);
        let sid = *ps[0].session_id().unwrap();
        for p in &ps {
            assert!(p.is_session_acknowledged(), "member {}", p.id());
            assert_eq!(p.session_id(), Some(&sid));
        }
    }

    #[test]
    fn test_yet_to_authenticate_before_broadcast() {
        let mut ps = parties(&["1", "2"]);
        let msg = ps[0].commit(&names(&["2"])).unwrap();
        assert_eq!(ps[0].yet_to_authenticate(), BTreeSet::from(["1".to_string(), "2".to_string()]));
        let down = ps[1].upflow(&msg).unwrap();
        assert_eq!(ps[1].yet_to_authenticate(), BTreeSet::from(["1".to_string()]));

        let confirm = ps[0].downflow(&down).unwrap().unwrap();
        assert!(ps[0].is_session_acknowledged());
        assert!(ps[1].downflow(&confirm).unwrap().is_none());
        assert!(ps[1].is_session_acknowledged());
    }

    #[test]
    fn test_forged_signature_rejected() {
        let mut ps = parties(&["1", "2"]);
        let msg = ps[0].commit(&names(&["2"])).unwrap();
        let mut down = ps[1].upflow(&msg).unwrap();
        if let Some(sig) = down.session_signature.as_mut() {
            sig[0] ^= 0xff;
        }
        assert_eq!(ps[0].downflow(&down), Err(GreetError::SessionAuthFailed("2".to_string())));
    }

    #[test]
    fn test_altered_own_nonce_rejected() {
        let mut ps = parties(&["1", "2"]);
        let mut msg = ps[0].commit(&names(&["2"])).unwrap();
        msg.nonces[0][0] ^= 0xff;
        let down = ps[1].upflow(&msg).unwrap();
        assert!(matches!(ps[0].downflow(&down), Err(GreetError::SessionAuthFailed(_))));
    }

    #[test]
    fn test_join_and_exclude() {
        let mut ps = parties(&["1", "2", "3", "4", "5"]);
        let (old, new) = ps.split_at_mut(3);
        run_commit(old);
        let old_sid = *old[0].session_id().unwrap();

        let mut msg = old[1].join(&names(&["4", "5"])).unwrap();
        for p in new.iter_mut() {
            msg = p.upflow(&msg).unwrap();
        }
        flood(&mut ps, msg);
        for p in &ps {
            assert!(p.is_session_acknowledged(), "member {}", p.id());
        }
        assert_ne!(ps[0].session_id(), Some(&old_sid));

        let msg = ps[2].exclude(&names(&["1", "4"])).unwrap();
        assert_eq!(msg.members, names(&["2", "3", "5"]));
        flood(&mut ps, msg);
        for i in [1, 2, 4] {
            assert!(ps[i].is_session_acknowledged(), "member {}", ps[i].id());
            assert_eq!(ps[i].members(), names(&["2", "3", "5"]).as_slice());
        }
    }

    #[test]
    fn test_quit_discloses_key() {
        let mut ps = parties(&["1", "2"]);
        run_commit(&mut ps);
        let pub_key = *ps[1].ephemeral_pub_key("1").unwrap();

        let msg = ps[0].quit().unwrap();
        let revealed = msg.signing_key.unwrap();
        ps[1].record_quit("1", msg.signing_key);
        assert_eq!(ps[1].revealed_key("1"), Some(&revealed));
        assert_eq!(GreetSigningKey::from_bytes(&revealed).verifying_key().to_bytes(), pub_key);
        assert!(ps[0].quit().is_err());
    }
}
