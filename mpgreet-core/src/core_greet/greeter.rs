//! Entry point for membership operations of one member
//!
//! The [`Greeter`] turns a requested membership change into the initial
//! packet of a [`Greeting`], recognises incoming initial packets and creates
//! greetings for them, and tells the transport layer which packets start and
//! end an operation without running the protocol.

use super::context::GreetContext;
use super::directory::PubKeyDirectory;
use super::errors::{GreetError, GreetResult};
use super::greet_type::GreetType;
use super::greeting::{Greeting, GreetingHandle};
use super::metadata::{GreetingMetadata, GreetingSummary};
use super::packet::{decode_packet, packet_id, peek_packet};
use super::store::GreetStore;
use crate::core_crypto::{Digest, GreetSigningKey};
use crate::metrics::{self as greet_metrics, names};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Classify a membership change
///
/// Returns the initiating greet type and the members it applies to. For a
/// new session or a refresh these are all members other than `owner`; for
/// an include the joiners; for an exclude the departures.
///
/// # Errors
///
/// [`GreetError::MixedMembershipChange`] if members both join and leave.
pub fn determine_flow_type(
    owner: &str,
    old_members: &BTreeSet<String>,
    new_members: &BTreeSet<String>,
) -> GreetResult<(GreetType, BTreeSet<String>)> {
    let joining: BTreeSet<String> = new_members.difference(old_members).cloned().collect();
    let leaving: BTreeSet<String> = old_members.difference(new_members).cloned().collect();

    if !joining.is_empty() && !leaving.is_empty() {
        return Err(GreetError::MixedMembershipChange);
    }
    if old_members.len() == 1 && old_members.contains(owner) {
        let others = new_members.iter().filter(|m| *m != owner).cloned().collect();
        return Ok((GreetType::InitInitiatorUp, others));
    }
    if !leaving.is_empty() {
        return Ok((GreetType::ExcludeAuxInitiatorDown, leaving));
    }
    if !joining.is_empty() {
        return Ok((GreetType::IncludeAuxInitiatorUp, joining));
    }
    let others = new_members.iter().filter(|m| *m != owner).cloned().collect();
    Ok((GreetType::RefreshAuxInitiatorDown, others))
}

fn lock(handle: &GreetingHandle) -> GreetResult<std::sync::MutexGuard<'_, Greeting>> {
    handle
        .lock()
        .map_err(|_: PoisonError<_>| GreetError::Internal("greeting lock poisoned".into()))
}

/// Creates and tracks the greetings of one member
pub struct Greeter {
    ctx: Arc<GreetContext>,
    proposed_greeting: Option<GreetingHandle>,
    proposal_hash: Option<Digest>,
    current_greeting: Option<GreetingHandle>,
    current_pi: Option<Digest>,
}

impl Greeter {
    pub fn new(
        id: impl Into<String>,
        signing_key: GreetSigningKey,
        directory: Arc<dyn PubKeyDirectory>,
    ) -> Self {
        Self::with_context(GreetContext::new(id, signing_key, directory))
    }

    pub fn with_context(ctx: GreetContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            proposed_greeting: None,
            proposal_hash: None,
            current_greeting: None,
            current_pi: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.ctx.id
    }

    pub fn context(&self) -> &Arc<GreetContext> {
        &self.ctx
    }

    /// Greeting of the operation currently accepted, if any
    pub fn current_greeting(&self) -> Option<GreetingHandle> {
        self.current_greeting.clone()
    }

    /// Id of the initial packet of the current operation
    pub fn current_pi(&self) -> Option<Digest> {
        self.current_pi
    }

    /// Propose a membership change, returning the initial packet
    ///
    /// The proposal only takes effect once the packet comes back through
    /// [`Greeter::decode`].
    ///
    /// # Arguments
    ///
    /// * `prior` - store of the last completed operation, `None` for a new session
    /// * `old_members` - current membership, `None` meaning just ourselves
    /// * `new_members` - requested membership
    /// * `metadata` - causal metadata of the new operation, authored by this member
    pub fn encode(
        &mut self,
        prior: Option<&GreetStore>,
        old_members: Option<&BTreeSet<String>>,
        new_members: &BTreeSet<String>,
        metadata: GreetingMetadata,
    ) -> GreetResult<Vec<u8>> {
        let just_me = BTreeSet::from([self.ctx.id.clone()]);
        let old_members = old_members.unwrap_or(&just_me);
        let (flow, members) = determine_flow_type(&self.ctx.id, old_members, new_members)?;
        let members: Vec<String> = members.into_iter().collect();

        let mut greeting = Greeting::new(Arc::clone(&self.ctx), prior)?;
        let mut message = match flow {
            GreetType::InitInitiatorUp => greeting.start(&members)?,
            GreetType::IncludeAuxInitiatorUp => greeting.include(&members)?,
            GreetType::ExcludeAuxInitiatorDown => greeting.exclude(&members)?,
            _ => greeting.refresh()?,
        };
        greeting.set_next_members(new_members.clone());
        greeting.set_metadata(metadata.clone());
        message.metadata = Some(metadata);

        let packet = greeting.encode(&message)?;
        info!("{} proposes {} for {:?}", self.ctx.id, flow.name(), new_members);
        self.proposal_hash = Some(packet_id(&packet));
        self.proposed_greeting = Some(Arc::new(Mutex::new(greeting)));
        Ok(packet)
    }

    /// Summarise a packet without running the protocol
    ///
    /// Returns `None` if the packet neither starts nor ends an operation from
    /// this member's point of view. An initial packet must carry metadata;
    /// the operation's final packet carries the initial packet's id in
    /// `prev_pi`. `make_packet_id` is only called when the packet is both
    /// initial and final.
    pub fn partial_decode<F>(
        &self,
        prev_members: Option<&BTreeSet<String>>,
        packet: &[u8],
        sender: &str,
        make_packet_id: F,
    ) -> GreetResult<Option<GreetingSummary>>
    where
        F: FnOnce() -> Digest,
    {
        let peek = peek_packet(packet)?;
        if peek.source != sender {
            debug!("Packet from {} claims source {}", sender, peek.source);
            return Ok(None);
        }

        let summary = if peek.greet_type.is_initiating() {
            let Some(metadata) = peek.metadata else {
                debug!("Initial {} from {} has no metadata", peek.greet_type, sender);
                return Ok(None);
            };
            let prev = prev_members
                .cloned()
                .unwrap_or_else(|| BTreeSet::from([sender.to_string()]));
            let members: BTreeSet<String> = peek.members.iter().cloned().collect();
            let (flow, delta) = match determine_flow_type(sender, &prev, &members) {
                Ok(classified) => classified,
                Err(e) => {
                    debug!("Cannot classify {} from {}: {}", peek.greet_type, sender, e);
                    return Ok(None);
                }
            };
            if flow != peek.greet_type {
                debug!("{} from {} looks like {}", peek.greet_type, sender, flow);
            }

            let is_final = match peek.greet_type {
                GreetType::RefreshAuxInitiatorDown => true,
                GreetType::ExcludeAuxInitiatorDown => {
                    members.len() == 1 && members.contains(sender)
                }
                _ => false,
            };
            GreetingSummary {
                metadata: Some(metadata),
                prev_members: prev,
                members: delta,
                flow: peek.greet_type,
                prev_pi: if is_final { Some(make_packet_id()) } else { None },
            }
        } else if peek.greet_type.is_confirm() {
            let (Some(greeting), Some(pi)) = (&self.current_greeting, self.current_pi) else {
                return Ok(None);
            };
            let greeting = lock(greeting)?;
            if greeting.pending_confirmations() != BTreeSet::from([sender.to_string()]) {
                return Ok(None);
            }
            GreetingSummary {
                metadata: None,
                prev_members: prev_members.cloned().unwrap_or_default(),
                members: greeting.get_next_members().clone(),
                flow: peek.greet_type,
                prev_pi: Some(pi),
            }
        } else {
            return Ok(None);
        };

        greet_metrics::record_counter(names::PARTIAL_DECODE_SUMMARIES, 1);
        Ok(Some(summary))
    }

    /// Accept a packet into the current operation
    ///
    /// Our own proposal coming back yields the proposed greeting. Any other
    /// initial packet creates a new greeting continuing from `prior`; other
    /// packets belong to the current greeting.
    ///
    /// # Errors
    ///
    /// Fails if the packet does not verify, or if a non-initial packet
    /// arrives with no operation in progress.
    pub fn decode(
        &mut self,
        prior: Option<&GreetStore>,
        prev_members: Option<&BTreeSet<String>>,
        packet: &[u8],
        sender: &str,
        pid: Digest,
    ) -> GreetResult<GreetingHandle> {
        if self.proposal_hash.is_some() && self.proposal_hash == Some(packet_id(packet)) {
            if let Some(greeting) = &self.proposed_greeting {
                // kept until the next encode, so redelivery yields the same greeting
                self.current_greeting = Some(Arc::clone(greeting));
                self.current_pi = Some(pid);
                return Ok(Arc::clone(greeting));
            }
        }

        let peek = peek_packet(packet)?;
        if !peek.greet_type.is_initiating() {
            return self.current_greeting.clone().ok_or_else(|| {
                GreetError::Precondition(format!(
                    "No operation in progress for {} from {}.",
                    peek.greet_type, sender
                ))
            });
        }

        let key = self.ctx.directory.require(sender)?;
        let message = decode_packet(packet, &key)?;
        if message.source != sender {
            return Err(GreetError::Decode(format!(
                "packet from {} claims source {}",
                sender, message.source
            )));
        }
        let metadata = message
            .metadata
            .ok_or_else(|| {
                GreetError::Decode(format!("initial {} without metadata", message.greet_type))
            })?;

        let mut greeting = Greeting::new(Arc::clone(&self.ctx), prior)?;
        greeting.set_metadata(metadata);
        let next_members: BTreeSet<String> = message.members.iter().cloned().collect();
        debug!(
            "{} accepts {} from {} (previously {:?})",
            self.ctx.id,
            message.greet_type,
            sender,
            prev_members
        );
        greeting.set_next_members(next_members);

        let handle = Arc::new(Mutex::new(greeting));
        self.current_greeting = Some(Arc::clone(&handle));
        self.current_pi = Some(pid);
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_greet::directory::MemoryDirectory;
    use crate::core_greet::message::GreetMessage;

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn greeters(ids: &[&str]) -> Vec<Greeter> {
        let directory = MemoryDirectory::new();
        let keys: Vec<GreetSigningKey> = ids
            .iter()
            .map(|id| {
                let key = GreetSigningKey::generate();
                directory.insert(*id, key.verifying_key()).unwrap();
                key
            })
            .collect();
        let directory: Arc<dyn PubKeyDirectory> = Arc::new(directory);
        ids.iter()
            .zip(keys)
            .map(|(id, key)| Greeter::new(*id, key, directory.clone()))
            .collect()
    }

    fn metadata(author: &str) -> GreetingMetadata {
        GreetingMetadata::create([1u8; 32], [2u8; 32], author, [[3u8; 32]])
    }

    #[test]
    fn test_determine_flow_type() {
        let group = set(&["1", "2", "3"]);

        let (flow, members) = determine_flow_type("1", &set(&["1"]), &group).unwrap();
        assert_eq!(flow, GreetType::InitInitiatorUp);
        assert_eq!(members, set(&["2", "3"]));

        let (flow, members) = determine_flow_type("1", &group, &set(&["1", "2"])).unwrap();
        assert_eq!(flow, GreetType::ExcludeAuxInitiatorDown);
        assert_eq!(members, set(&["3"]));

        let (flow, members) =
            determine_flow_type("1", &group, &set(&["1", "2", "3", "4"])).unwrap();
        assert_eq!(flow, GreetType::IncludeAuxInitiatorUp);
        assert_eq!(members, set(&["4"]));

        let (flow, members) = determine_flow_type("1", &group, &group).unwrap();
        assert_eq!(flow, GreetType::RefreshAuxInitiatorDown);
        assert_eq!(members, set(&["2", "3"]));
    }

    #[test]
    fn test_mixed_change_rejected() {
        let err =
            determine_flow_type("1", &set(&["1", "2", "3"]), &set(&["1", "2", "4"])).unwrap_err();
        assert_eq!(err, GreetError::MixedMembershipChange);
        assert_eq!(err.to_string(), "Cannot both exclude and join members.");
    }

    #[test]
    fn test_encode_rejects_foreign_author() {
        let mut gs = greeters(&["1", "2"]);
        let result = gs[0].encode(None, None, &set(&["1", "2"]), metadata("2"));
        assert!(matches!(result, Err(GreetError::Precondition(_))));
        assert!(gs[0].current_greeting().is_none());
    }

    #[test]
    fn test_decode_own_proposal_returns_same_greeting() {
        let mut gs = greeters(&["1", "2"]);
        let packet = gs[0].encode(None, None, &set(&["1", "2"]), metadata("1")).unwrap();
        let first = gs[0].decode(None, None, &packet, "1", [9u8; 32]).unwrap();
        assert_eq!(first.lock().unwrap().get_next_members(), &set(&["1", "2"]));
        assert_eq!(gs[0].current_pi(), Some([9u8; 32]));

        let again = gs[0].decode(None, None, &packet, "1", [9u8; 32]).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(Arc::ptr_eq(&gs[0].current_greeting().unwrap(), &first));

        let other = gs[1].decode(None, None, &packet, "1", [9u8; 32]).unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(other.lock().unwrap().metadata(), Some(&metadata("1")));
    }

    #[test]
    fn test_decode_without_operation() {
        let mut gs = greeters(&["1", "2"]);
        let mut greeting = Greeting::new(Arc::clone(gs[0].context()), None).unwrap();
        greeting.start(&["2".to_string()]).unwrap();
        let mut confirm = GreetMessage::new("1", "", GreetType::InitParticipantConfirmDown);
        confirm.members = vec!["1".into(), "2".into()];
        let packet = greeting.encode(&confirm).unwrap();
        assert!(matches!(
            gs[1].decode(None, None, &packet, "1", [0u8; 32]),
            Err(GreetError::Precondition(_))
        ));
    }

    #[test]
    fn test_partial_decode_initial_packets() {
        let mut gs = greeters(&["1", "2", "3"]);
        let packet = gs[0].encode(None, None, &set(&["1", "2", "3"]), metadata("1")).unwrap();

        let summary = gs[1].partial_decode(None, &packet, "1", || unreachable!()).unwrap().unwrap();
        assert!(summary.is_initial());
        assert!(!summary.is_final());
        assert_eq!(summary.flow, GreetType::InitInitiatorUp);
        assert_eq!(summary.prev_members, set(&["1"]));
        assert_eq!(summary.members, set(&["2", "3"]));
        assert_eq!(summary.metadata, Some(metadata("1")));

        // wrong sender
        assert!(gs[1].partial_decode(None, &packet, "2", || [0u8; 32]).unwrap().is_none());
    }

    #[test]
    fn test_partial_decode_without_operation() {
        let gs = greeters(&["1", "2"]);
        let mut greeting = Greeting::new(Arc::clone(gs[0].context()), None).unwrap();
        greeting.start(&["2".to_string()]).unwrap();
        let mut confirm = GreetMessage::new("1", "", GreetType::InitParticipantConfirmDown);
        confirm.members = vec!["1".into(), "2".into()];
        let packet = greeting.encode(&confirm).unwrap();
        assert!(gs[1].partial_decode(None, &packet, "1", || [0u8; 32]).unwrap().is_none());
    }
}
