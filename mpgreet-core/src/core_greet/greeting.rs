//! A single membership operation in progress
//!
//! A [`Greeting`] combines one CLIQUES key agreement and one ASKE key
//! exchange. Incoming packets go through [`Greeting::recv`]; packets this
//! member has to send in response are published on [`Greeting::on_send`].
//! The operation completes once every member has confirmed the session and
//! this member has seen its own confirmation come back from the transport.

use super::aske::{AskeMember, AskeMessage};
use super::cliques::{Agreement, CliquesMember, CliquesMessage};
use super::context::GreetContext;
use super::errors::{GreetError, GreetResult};
use super::greet_type::{GreetBit, GreetType, Operation};
use super::message::GreetMessage;
use super::metadata::GreetingMetadata;
use super::packet::{decode_packet, encode_packet, packet_id};
use super::store::{GreetStore, GreetingState};
use crate::core_async::{Cancel, Observable};
use crate::metrics::{self as greet_metrics, names};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Shared handle to a greeting
pub type GreetingHandle = Arc<Mutex<Greeting>>;

/// How an operation ended
pub type GreetOutcome = Result<Arc<GreetStore>, GreetError>;

/// A packet to hand to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendItem {
    pub packet: Vec<u8>,
    pub recipients: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finished {
    Pending,
    Succeeded,
    Failed,
}

/// Result of running one message through the sub-protocols
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedMessage {
    /// Reply to send, if any
    pub decoded: Option<GreetMessage>,
    pub new_state: Option<GreetingState>,
}

impl ProcessedMessage {
    fn nothing() -> Self {
        Self::default()
    }

    fn state(new_state: GreetingState) -> Self {
        Self { decoded: None, new_state: Some(new_state) }
    }
}

/// Awaitable view of a greeting's outcome
#[derive(Clone)]
pub struct Completion {
    rx: watch::Receiver<Option<GreetOutcome>>,
}

impl Completion {
    /// The outcome, if the operation has already ended
    pub fn outcome(&self) -> Option<GreetOutcome> {
        self.rx.borrow().clone()
    }

    /// Wait until the operation ends
    pub async fn wait(mut self) -> GreetOutcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome)
                .clone()
                .unwrap_or_else(|| {
                    Err(GreetError::Internal("completion signalled without outcome".into()))
                }),
            Err(_) => Err(GreetError::OperationFailed(
                "greeting dropped before completion".into(),
            )),
        }
    }
}

/// Members excluded by someone else keep watching until everyone else has
/// confirmed, so they agree with the others on where the operation ended
#[derive(Debug, Clone)]
struct Bystander {
    excluded_by: String,
    pending: BTreeSet<String>,
}

pub struct Greeting {
    ctx: Arc<GreetContext>,
    state: GreetingState,
    operation: Option<Operation>,
    cliques: CliquesMember,
    aske: AskeMember,
    next_members: BTreeSet<String>,
    initial_metadata: Option<GreetingMetadata>,
    latest_metadata: Option<GreetingMetadata>,
    recv_own_auth_message: bool,
    bystander: Option<Bystander>,
    outcome: Option<GreetOutcome>,
    completion: watch::Sender<Option<GreetOutcome>>,
    on_send: Observable<SendItem>,
    on_complete: Observable<GreetOutcome>,
}

impl fmt::Debug for Greeting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Greeting")
            .field("id", &self.ctx.id)
            .field("state", &self.state)
            .field("operation", &self.operation)
            .field("finished", &self.finished())
            .finish()
    }
}

fn cliques_part(message: &GreetMessage) -> CliquesMessage {
    CliquesMessage {
        source: message.source.clone(),
        dest: message.dest.clone(),
        agreement: if message.greet_type.operation() == Operation::Start {
            Agreement::Initial
        } else {
            Agreement::Auxiliary
        },
        members: message.members.clone(),
        int_keys: message.int_keys.clone(),
    }
}

fn aske_part(message: &GreetMessage) -> AskeMessage {
    AskeMessage {
        source: message.source.clone(),
        dest: message.dest.clone(),
        members: message.members.clone(),
        nonces: message.nonces.clone(),
        pub_keys: message.pub_keys.clone(),
        session_signature: message.session_signature.clone(),
        signing_key: message.signing_key,
    }
}

/// Combine the sub-protocol outputs into one greet message
///
/// Returns `None` when neither sub-protocol produced anything.
///
/// # Errors
///
/// Fails with [`GreetError::Internal`] when the outputs disagree on
/// addressing or membership.
pub fn merge_messages(
    cliques: Option<CliquesMessage>,
    aske: Option<AskeMessage>,
    greet_type: GreetType,
) -> GreetResult<Option<GreetMessage>> {
    let merged = match (cliques, aske) {
        (None, None) => return Ok(None),
        (Some(c), None) => {
            let mut message = GreetMessage::new(c.source, c.dest, greet_type);
            message.members = c.members;
            message.int_keys = c.int_keys;
            message
        }
        (None, Some(a)) => {
            let mut message = GreetMessage::new(a.source, a.dest, greet_type);
            message.members = a.members;
            message.nonces = a.nonces;
            message.pub_keys = a.pub_keys;
            message.session_signature = a.session_signature;
            message.signing_key = a.signing_key;
            message
        }
        (Some(c), Some(a)) => {
            if c.source != a.source || c.dest != a.dest {
                return Err(GreetError::Internal(format!(
                    "sub-protocols disagree on addressing: {} -> {:?} vs {} -> {:?}",
                    c.source, c.dest, a.source, a.dest
                )));
            }
            if c.members != a.members {
                return Err(GreetError::Internal("sub-protocols disagree on members".into()));
            }
            let mut message = GreetMessage::new(c.source, c.dest, greet_type);
            message.members = c.members;
            message.int_keys = c.int_keys;
            message.nonces = a.nonces;
            message.pub_keys = a.pub_keys;
            message.session_signature = a.session_signature;
            message.signing_key = a.signing_key;
            message
        }
    };
    Ok(Some(merged))
}

impl Greeting {
    /// Create a greeting continuing from `prior`, or a fresh one in NULL
    ///
    /// # Errors
    ///
    /// Fails if `prior` belongs to another member.
    pub fn new(ctx: Arc<GreetContext>, prior: Option<&GreetStore>) -> GreetResult<Self> {
        let (state, cliques, mut aske) = match prior {
            Some(store) => {
                if store.id() != ctx.id {
                    return Err(GreetError::Precondition(format!(
                        "Greet store of {} cannot be used by {}.",
                        store.id(),
                        ctx.id
                    )));
                }
                (store.state(), store.cliques().clone(), store.aske().clone())
            }
            None => (
                GreetingState::Null,
                CliquesMember::new(ctx.id.clone()),
                AskeMember::new(
                    ctx.id.clone(),
                    Arc::clone(&ctx.signing_key),
                    Arc::clone(&ctx.directory),
                ),
            ),
        };
        aske.reset_authentication();
        let (completion, _) = watch::channel(None);

        Ok(Self {
            ctx,
            state,
            operation: None,
            cliques,
            aske,
            next_members: BTreeSet::new(),
            initial_metadata: None,
            latest_metadata: None,
            recv_own_auth_message: false,
            bystander: None,
            outcome: None,
            completion,
            on_send: Observable::new(),
            on_complete: Observable::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.ctx.id
    }

    pub fn state(&self) -> GreetingState {
        self.state
    }

    pub fn operation(&self) -> Option<Operation> {
        self.operation
    }

    /// Current members in protocol order
    pub fn members(&self) -> &[String] {
        self.cliques.members()
    }

    /// Membership once this operation completes
    pub fn get_next_members(&self) -> &BTreeSet<String> {
        &self.next_members
    }

    pub(crate) fn set_next_members(&mut self, members: BTreeSet<String>) {
        self.next_members = members;
    }

    /// Metadata of the packet that started this operation
    pub fn metadata(&self) -> Option<&GreetingMetadata> {
        self.initial_metadata.as_ref()
    }

    pub(crate) fn set_metadata(&mut self, metadata: GreetingMetadata) {
        self.latest_metadata = Some(metadata.clone());
        self.initial_metadata = Some(metadata);
    }

    pub fn finished(&self) -> Finished {
        match &self.outcome {
            None => Finished::Pending,
            Some(Ok(_)) => Finished::Succeeded,
            Some(Err(_)) => Finished::Failed,
        }
    }

    /// The store of the completed operation
    ///
    /// # Errors
    ///
    /// [`GreetError::NotFinished`] while the operation is running; otherwise
    /// the error the operation failed with.
    pub fn get_result_state(&self) -> GreetResult<Arc<GreetStore>> {
        match &self.outcome {
            None => Err(GreetError::NotFinished),
            Some(Ok(store)) => Ok(Arc::clone(store)),
            Some(Err(e)) => Err(e.clone()),
        }
    }

    pub fn completion(&self) -> Completion {
        Completion { rx: self.completion.subscribe() }
    }

    /// Subscribe to packets this greeting wants sent
    pub fn on_send<F>(&self, callback: F) -> Cancel
    where
        F: Fn(&SendItem) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_send.subscribe(callback)
    }

    /// Subscribe to the outcome; called once when the operation ends
    pub fn on_complete<F>(&self, callback: F) -> Cancel
    where
        F: Fn(&GreetOutcome) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_complete.subscribe_once(callback)
    }

    /// Members whose confirmation is still outstanding, ourselves included
    /// until our own confirmation has come back
    pub fn pending_confirmations(&self) -> BTreeSet<String> {
        if let Some(bystander) = &self.bystander {
            return bystander.pending.clone();
        }
        let mut pending = self.aske.yet_to_authenticate();
        if !self.recv_own_auth_message {
            pending.insert(self.ctx.id.clone());
        }
        pending
    }

    /// Snapshot of the current key material
    pub fn store(&self) -> GreetStore {
        GreetStore::new(self.ctx.id.clone(), self.state, self.cliques.clone(), self.aske.clone())
    }

    fn merged(
        cliques: Option<CliquesMessage>,
        aske: Option<AskeMessage>,
        greet_type: GreetType,
    ) -> GreetResult<GreetMessage> {
        merge_messages(cliques, aske, greet_type)?
            .ok_or_else(|| GreetError::Internal(format!("no output for {}", greet_type)))
    }

    fn require_state(&self, operation: &'static str, allowed: GreetingState) -> GreetResult<()> {
        if self.state != allowed || self.operation.is_some() {
            return Err(GreetError::InvalidState { operation, state: self.state.to_string() });
        }
        Ok(())
    }

    fn begin(
        &mut self,
        operation: Operation,
        state: GreetingState,
        next_members: BTreeSet<String>,
    ) {
        info!("{} starts {} towards {:?}", self.ctx.id, operation, next_members);
        self.operation = Some(operation);
        self.state = state;
        self.next_members = next_members;
    }

    /// Start a new session with `others`
    pub fn start(&mut self, others: &[String]) -> GreetResult<GreetMessage> {
        self.require_state("start", GreetingState::Null)?;
        let cliques = self.cliques.ika(others)?;
        let aske = self.aske.commit(others)?;
        let message = Self::merged(Some(cliques), Some(aske), GreetType::InitInitiatorUp)?;

        let next = message.members.iter().cloned().collect();
        self.begin(Operation::Start, GreetingState::InitUpflow, next);
        Ok(message)
    }

    /// Add `new_members` to the session
    pub fn include(&mut self, new_members: &[String]) -> GreetResult<GreetMessage> {
        if new_members.is_empty() {
            return Err(GreetError::Precondition("No members to add.".into()));
        }
        self.require_state("include", GreetingState::Ready)?;
        let cliques = self.cliques.aka_join(new_members)?;
        let aske = self.aske.join(new_members)?;
        let message = Self::merged(Some(cliques), Some(aske), GreetType::IncludeAuxInitiatorUp)?;

        let next = message.members.iter().cloned().collect();
        self.begin(Operation::Include, GreetingState::AuxUpflow, next);
        Ok(message)
    }

    /// Remove `excluded` from the session
    pub fn exclude(&mut self, excluded: &[String]) -> GreetResult<GreetMessage> {
        if excluded.is_empty() {
            return Err(GreetError::Precondition("No members to exclude.".into()));
        }
        if excluded.iter().any(|m| *m == self.ctx.id) {
            return Err(GreetError::Precondition("Cannot exclude myself.".into()));
        }
        self.require_state("exclude", GreetingState::Ready)?;
        let cliques = self.cliques.aka_exclude(excluded)?;
        let aske = self.aske.exclude(excluded)?;
        let message = Self::merged(Some(cliques), Some(aske), GreetType::ExcludeAuxInitiatorDown)?;

        let next = message.members.iter().cloned().collect();
        self.begin(Operation::Exclude, GreetingState::AuxDownflow, next);
        Ok(message)
    }

    /// Renew the group key without changing membership
    pub fn refresh(&mut self) -> GreetResult<GreetMessage> {
        self.require_state("refresh", GreetingState::Ready)?;
        let cliques = self.cliques.aka_refresh()?;
        let message = Self::merged(Some(cliques), None, GreetType::RefreshAuxInitiatorDown)?;

        let next = message.members.iter().cloned().collect();
        self.begin(Operation::Refresh, GreetingState::AuxDownflow, next);
        Ok(message)
    }

    /// Leave the session, disclosing the ephemeral signing key
    ///
    /// An operation still running fails.
    pub fn quit(&mut self) -> GreetResult<GreetMessage> {
        if self.state == GreetingState::Quit {
            return Err(GreetError::InvalidState {
                operation: "quit",
                state: self.state.to_string(),
            });
        }
        let aske = self.aske.quit()?;
        self.cliques.aka_quit();
        self.state = GreetingState::Quit;
        info!("{} quits the session", self.ctx.id);
        self.fail("Quit before completing.");
        Self::merged(None, Some(aske), GreetType::QuitDown)
    }

    /// Abort the operation; does nothing once it has ended
    pub fn fail(&mut self, reason: &str) {
        self.finish(Err(GreetError::OperationFailed(reason.to_string())));
    }

    /// Sign and serialize a message with this member's key
    pub fn encode(&self, message: &GreetMessage) -> GreetResult<Vec<u8>> {
        encode_packet(message, &self.ctx.signing_key)
    }

    /// Run one verified message through the state machine
    ///
    /// Returns `None` when the greeting has quit.
    pub fn process_message(
        &mut self,
        message: &GreetMessage,
    ) -> GreetResult<Option<ProcessedMessage>> {
        let id = self.ctx.id.clone();
        if self.state == GreetingState::Quit {
            return Ok(None);
        }
        if !message.dest.is_empty() && message.dest != id {
            trace!("{} ignores upflow for {}", id, message.dest);
            return Ok(Some(ProcessedMessage::nothing()));
        }
        if message.greet_type == GreetType::QuitDown {
            debug!("{} saw {} quit", id, message.source);
            self.aske.record_quit(&message.source, message.signing_key);
            return Ok(Some(ProcessedMessage::nothing()));
        }

        let op = message.operation();
        match self.operation {
            Some(current) if current != op => {
                return Err(GreetError::Decode(format!(
                    "{} message {} arrived during {}",
                    op, message.greet_type, current
                )));
            }
            Some(_) => {}
            None => self.operation = Some(op),
        }

        if message.is_downflow() {
            if !message.contains(&id) {
                return Ok(Some(ProcessedMessage::state(GreetingState::Quit)));
            }
            if message.source == id {
                return Ok(Some(ProcessedMessage::nothing()));
            }
            if !message.contains(&message.source) {
                warn!("{} ignores broadcast from non-member {}", id, message.source);
                return Ok(Some(ProcessedMessage::nothing()));
            }
            self.process_downflow(message, op).map(Some)
        } else {
            self.process_upflow(message, op).map(Some)
        }
    }

    fn process_upflow(
        &mut self,
        message: &GreetMessage,
        op: Operation,
    ) -> GreetResult<ProcessedMessage> {
        let cliques = if message.is_gka() {
            Some(self.cliques.upflow(&cliques_part(message))?)
        } else {
            None
        };
        let aske = if message.greet_type.is_ske() {
            Some(self.aske.upflow(&aske_part(message))?)
        } else {
            None
        };

        let last = match (&cliques, &aske) {
            (Some(c), _) => c.is_downflow(),
            (None, Some(a)) => a.is_downflow(),
            (None, None) => false,
        };
        let silent = self.ctx.silence_illegal_types;
        let mut greet_type = message.greet_type.set_bit(GreetBit::Init, false, silent)?;
        if last {
            greet_type = greet_type.set_bit(GreetBit::Down, true, silent)?;
        }
        let decoded = merge_messages(cliques, aske, greet_type)?;

        let new_state = match (op, last) {
            (Operation::Start, false) => GreetingState::InitUpflow,
            (Operation::Start, true) => GreetingState::InitDownflow,
            (_, false) => GreetingState::AuxUpflow,
            (_, true) => GreetingState::AuxDownflow,
        };
        Ok(ProcessedMessage { decoded, new_state: Some(new_state) })
    }

    fn process_downflow(
        &mut self,
        message: &GreetMessage,
        op: Operation,
    ) -> GreetResult<ProcessedMessage> {
        if message.is_gka() {
            self.cliques.downflow(&cliques_part(message))?;
        }
        let aske = if message.greet_type.is_ske() {
            self.aske.downflow(&aske_part(message))?
        } else {
            None
        };
        let decoded = match aske {
            Some(reply) => {
                let greet_type = GreetType::confirm_for(op)
                    .ok_or_else(|| GreetError::Internal(format!("no confirmation for {}", op)))?;
                merge_messages(None, Some(reply), greet_type)?
            }
            None => None,
        };

        if op == Operation::Refresh {
            // only the initiator sends anything in a refresh
            self.recv_own_auth_message = true;
        }
        let new_state = if self.is_complete() {
            GreetingState::Ready
        } else if op == Operation::Start {
            GreetingState::InitDownflow
        } else {
            GreetingState::AuxDownflow
        };
        Ok(ProcessedMessage { decoded, new_state: Some(new_state) })
    }

    fn is_complete(&self) -> bool {
        if self.cliques.group_secret().is_none() || !self.recv_own_auth_message {
            return false;
        }
        match self.operation {
            Some(Operation::Refresh) => true,
            Some(_) => self.aske.is_session_acknowledged(),
            None => false,
        }
    }

    /// Receive a packet from `sender`
    ///
    /// Returns `Ok(false)` if the greeting has already ended and ignored the
    /// packet. Protocol errors fail the operation before being returned.
    pub fn recv(&mut self, packet: &[u8], sender: &str) -> GreetResult<bool> {
        let tracking = self.state == GreetingState::Quit && self.bystander.is_some();
        if self.finished() == Finished::Failed || (self.state == GreetingState::Quit && !tracking) {
            return Ok(false);
        }

        let message = match self.authenticate(packet, sender) {
            Ok(message) => message,
            Err(e) => {
                warn!("{} rejected packet from {}: {}", self.ctx.id, sender, e);
                self.finish(Err(e.clone()));
                return Err(e);
            }
        };
        let pid = packet_id(packet);
        if let Some(metadata) = &self.latest_metadata {
            self.latest_metadata = Some(metadata.advance(self.ctx.id.clone(), pid));
        }

        if tracking {
            self.track_bystander(&message);
            return Ok(false);
        }

        if message.is_downflow() && message.source == self.ctx.id {
            self.recv_own_auth_message = true;
        }

        let processed = match self.process_message(&message) {
            Ok(processed) => processed,
            Err(e) => {
                warn!(
                    "{} failed processing {} from {}: {}",
                    self.ctx.id, message.greet_type, sender, e
                );
                self.finish(Err(e.clone()));
                return Err(e);
            }
        };

        if let Some(processed) = processed {
            match processed.new_state {
                Some(GreetingState::Quit) => self.enter_bystander(&message),
                Some(state) => self.state = state,
                None => {}
            }
            if let Some(reply) = processed.decoded {
                self.send(reply)?;
            }
        }
        self.check_complete();
        Ok(true)
    }

    fn authenticate(&self, packet: &[u8], sender: &str) -> GreetResult<GreetMessage> {
        let key = self.ctx.directory.require(sender)?;
        let message = decode_packet(packet, &key)?;
        if message.source != sender {
            return Err(GreetError::Decode(format!(
                "packet from {} claims source {}",
                sender, message.source
            )));
        }
        Ok(message)
    }

    fn send(&mut self, mut message: GreetMessage) -> GreetResult<()> {
        message.metadata = self.latest_metadata.clone();
        let packet = self.encode(&message)?;
        let recipients = if message.is_downflow() {
            message.members.iter().filter(|m| **m != self.ctx.id).cloned().collect()
        } else {
            BTreeSet::from([message.dest.clone()])
        };
        trace!("{} sends {} to {:?}", self.ctx.id, message.greet_type, recipients);
        self.on_send.publish(&SendItem { packet, recipients });
        Ok(())
    }

    fn enter_bystander(&mut self, message: &GreetMessage) {
        info!("{} was excluded by {}", self.ctx.id, message.source);
        self.state = GreetingState::Quit;
        self.cliques.aka_quit();

        let acknowledging = message.greet_type.is_ske() && message.session_signature.is_some();
        let pending: BTreeSet<String> = if acknowledging {
            message.members.iter().filter(|m| **m != message.source).cloned().collect()
        } else {
            BTreeSet::new()
        };
        self.bystander = Some(Bystander { excluded_by: message.source.clone(), pending });
        self.settle_bystander();
    }

    fn track_bystander(&mut self, message: &GreetMessage) {
        if let Some(bystander) = self.bystander.as_mut() {
            if message.is_downflow() && message.greet_type.is_confirm() {
                bystander.pending.remove(&message.source);
            }
        }
        self.settle_bystander();
    }

    fn settle_bystander(&mut self) {
        let done = match &self.bystander {
            Some(bystander) if bystander.pending.is_empty() => Some(bystander.excluded_by.clone()),
            _ => None,
        };
        if let Some(by) = done {
            self.finish(Err(GreetError::Excluded(by)));
        }
    }

    fn check_complete(&mut self) {
        if self.outcome.is_some() || self.state == GreetingState::Quit {
            return;
        }
        if self.is_complete() {
            self.state = GreetingState::Ready;
            let store = Arc::new(self.store());
            self.finish(Ok(store));
        }
    }

    fn finish(&mut self, outcome: GreetOutcome) {
        if self.outcome.is_some() {
            return;
        }
        match &outcome {
            Ok(_) => {
                info!("{} completed {:?}", self.ctx.id, self.operation);
                greet_metrics::record_counter(names::OPERATIONS_COMPLETED, 1);
            }
            Err(e) => {
                info!("{} ended {:?}: {}", self.ctx.id, self.operation, e);
                greet_metrics::record_counter(names::OPERATIONS_FAILED, 1);
            }
        }
        self.outcome = Some(outcome.clone());
        self.completion.send_replace(Some(outcome.clone()));
        self.on_complete.publish(&outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_crypto::GreetSigningKey;
    use crate::core_greet::directory::{MemoryDirectory, PubKeyDirectory};
    use std::collections::VecDeque;

    type Queue = Arc<Mutex<VecDeque<(String, Vec<u8>)>>>;

    fn names(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn contexts(ids: &[&str]) -> Vec<Arc<GreetContext>> {
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
            .map(|(id, key)| Arc::new(GreetContext::new(*id, key, directory.clone())))
            .collect()
    }

    fn wire(greeting: &Greeting, queue: &Queue) {
        let queue = queue.clone();
        let id = greeting.id().to_string();
        greeting.on_send(move |item| {
            queue.lock().unwrap().push_back((id.clone(), item.packet.clone()));
            Ok(())
        });
    }

    /// Deliver queued packets to every greeting, sender included
    fn pump(greetings: &mut [Greeting], queue: &Queue, first: (String, Vec<u8>)) {
        queue.lock().unwrap().push_back(first);
        loop {
            let next = queue.lock().unwrap().pop_front();
            let Some((sender, packet)) = next else { break };
            for g in greetings.iter_mut() {
                g.recv(&packet, &sender).unwrap();
            }
        }
    }

    fn started(ids: &[&str]) -> (Vec<Greeting>, Queue) {
        let ctxs = contexts(ids);
        let queue: Queue = Arc::new(Mutex::new(VecDeque::new()));
        let mut greetings: Vec<Greeting> = ctxs
            .iter()
            .map(|c| Greeting::new(c.clone(), None).unwrap())
            .collect();
        for g in &greetings {
            wire(g, &queue);
        }
        let msg = greetings[0].start(&names(&ids[1..])).unwrap();
        let packet = greetings[0].encode(&msg).unwrap();
        pump(&mut greetings, &queue, (ids[0].to_string(), packet));
        (greetings, queue)
    }

    #[test]
    fn test_merge_messages() {
        let cliques = CliquesMessage {
            source: "1".into(),
            dest: "2".into(),
            agreement: Agreement::Initial,
            members: names(&["1", "2", "3", "4", "5", "6"]),
            int_keys: vec![None, Some([1u8; 32])],
        };
        let aske = AskeMessage {
            source: "1".into(),
            dest: "2".into(),
            members: names(&["1", "2", "3", "4", "5", "6"]),
            nonces: vec![[7u8; 32]],
            pub_keys: vec![[8u8; 32]],
            session_signature: None,
            signing_key: None,
        };
        let merged = merge_messages(
            Some(cliques.clone()),
            Some(aske.clone()),
            GreetType::InitInitiatorUp,
        )
        .unwrap()
        .unwrap();
        assert_eq!(merged.source, "1");
        assert_eq!(merged.dest, "2");
        assert_eq!(merged.members, cliques.members);
        assert_eq!(merged.int_keys, cliques.int_keys);
        assert_eq!(merged.nonces, aske.nonces);
        assert_eq!(merged.pub_keys, aske.pub_keys);
        assert_eq!(merged.session_signature, None);

        let mut mismatched = aske;
        mismatched.dest = "3".into();
        assert!(matches!(
            merge_messages(Some(cliques), Some(mismatched), GreetType::InitInitiatorUp),
            Err(GreetError::Internal(_))
        ));
        assert_eq!(merge_messages(None, None, GreetType::InitInitiatorUp), Ok(None));
    }

    #[test]
    fn test_start_preconditions() {
        let ctx = contexts(&["1"]).remove(0);
        let mut greeting = Greeting::new(ctx, None).unwrap();
        assert!(greeting.start(&[]).is_err());
        assert!(matches!(greeting.refresh(), Err(GreetError::InvalidState { .. })));
        assert!(greeting.include(&[]).is_err());
        assert_eq!(greeting.state(), GreetingState::Null);
    }

    #[test]
    fn test_start_message() {
        let ctx = contexts(&["1", "2", "3"]).remove(0);
        let mut greeting = Greeting::new(ctx, None).unwrap();
        let msg = greeting.start(&names(&["2", "3"])).unwrap();
        assert_eq!(msg.greet_type, GreetType::InitInitiatorUp);
        assert_eq!(msg.dest, "2");
        assert_eq!(msg.members, names(&["1", "2", "3"]));
        assert_eq!(greeting.state(), GreetingState::InitUpflow);
        assert_eq!(
            greeting.get_next_members(),
            &BTreeSet::from(["1".into(), "2".into(), "3".into()])
        );
        assert!(matches!(greeting.start(&names(&["2"])), Err(GreetError::InvalidState { .. })));
    }

    #[test]
    fn test_ignores_upflow_for_others() {
        let ctx = contexts(&["1", "2", "3"]).remove(2);
        let mut greeting = Greeting::new(ctx, None).unwrap();
        let msg = GreetMessage::new("1", "2", GreetType::InitInitiatorUp);
        assert_eq!(greeting.process_message(&msg).unwrap(), Some(ProcessedMessage::nothing()));
    }

    #[test]
    fn test_downflow_without_me_means_quit() {
        let ctx = contexts(&["1", "2", "3"]).remove(2);
        let mut greeting = Greeting::new(ctx, None).unwrap();
        let mut msg = GreetMessage::new("1", "", GreetType::ExcludeAuxInitiatorDown);
        msg.members = names(&["1", "2"]);
        assert_eq!(
            greeting.process_message(&msg).unwrap(),
            Some(ProcessedMessage::state(GreetingState::Quit))
        );
    }

    #[test]
    fn test_quit_state_processes_nothing() {
        let ctx = contexts(&["1"]).remove(0);
        let mut greeting = Greeting::new(ctx, None).unwrap();
        greeting.state = GreetingState::Quit;
        let msg = GreetMessage::new("2", "", GreetType::InitParticipantDown);
        assert_eq!(greeting.process_message(&msg).unwrap(), None);
    }

    #[test]
    fn test_initial_agreement() {
        let (greetings, _) = started(&["1", "2", "3", "4"]);
        let key = greetings[0].get_result_state().unwrap().group_key().unwrap();
        for g in &greetings {
            assert_eq!(g.state(), GreetingState::Ready, "member {}", g.id());
            assert_eq!(g.finished(), Finished::Succeeded);
            assert!(g.pending_confirmations().is_empty());
            let store = g.get_result_state().unwrap();
            assert_eq!(store.group_key().unwrap(), key);
            assert_eq!(store.members(), names(&["1", "2", "3", "4"]).as_slice());
        }
    }

    #[test]
    fn test_refresh_completes_everyone() {
        let (done, _) = started(&["1", "2", "3"]);
        let old_key = done[0].get_result_state().unwrap().group_key().unwrap();

        let queue: Queue = Arc::new(Mutex::new(VecDeque::new()));
        let mut next: Vec<Greeting> = done
            .iter()
            .map(|g| {
                let prior = g.get_result_state().unwrap();
                Greeting::new(g.ctx.clone(), Some(prior.as_ref())).unwrap()
            })
            .collect();
        for g in &next {
            wire(g, &queue);
        }
        let msg = next[1].refresh().unwrap();
        let packet = next[1].encode(&msg).unwrap();
        pump(&mut next, &queue, ("2".into(), packet));

        let key = next[0].get_result_state().unwrap().group_key().unwrap();
        assert_ne!(key, old_key);
        for g in &next {
            assert_eq!(g.get_result_state().unwrap().group_key().unwrap(), key);
        }
    }

    #[test]
    fn test_excluded_member_ends_with_others() {
        let (done, _) = started(&["1", "2", "3", "4"]);
        let queue: Queue = Arc::new(Mutex::new(VecDeque::new()));
        let mut next: Vec<Greeting> = done
            .iter()
            .map(|g| {
                let prior = g.get_result_state().unwrap();
                Greeting::new(g.ctx.clone(), Some(prior.as_ref())).unwrap()
            })
            .collect();
        for g in &next {
            wire(g, &queue);
        }
        let msg = next[0].exclude(&names(&["3"])).unwrap();
        assert_eq!(next[0].get_next_members().len(), 3);
        let packet = next[0].encode(&msg).unwrap();
        pump(&mut next, &queue, ("1".into(), packet));

        let key = next[0].get_result_state().unwrap().group_key().unwrap();
        for i in [0, 1, 3] {
            assert_eq!(next[i].get_result_state().unwrap().group_key().unwrap(), key);
        }
        assert_eq!(next[2].state(), GreetingState::Quit);
        assert_eq!(next[2].get_result_state().unwrap_err(), GreetError::Excluded("1".into()));
    }

    #[test]
    fn test_exclude_preconditions() {
        let (done, _) = started(&["1", "2"]);
        let prior = done[0].get_result_state().unwrap();
        let mut next = Greeting::new(done[0].ctx.clone(), Some(prior.as_ref())).unwrap();
        assert_eq!(
            next.exclude(&[]).unwrap_err(),
            GreetError::Precondition("No members to exclude.".into())
        );
        assert_eq!(
            next.exclude(&names(&["1"])).unwrap_err(),
            GreetError::Precondition("Cannot exclude myself.".into())
        );
        assert_eq!(
            next.include(&[]).unwrap_err(),
            GreetError::Precondition("No members to add.".into())
        );
    }

    #[test]
    fn test_fail_is_sticky() {
        let ctx = contexts(&["1", "2"]).remove(0);
        let mut greeting = Greeting::new(ctx, None).unwrap();
        greeting.start(&names(&["2"])).unwrap();
        assert_eq!(greeting.get_result_state().unwrap_err(), GreetError::NotFinished);

        greeting.fail("testing");
        assert_eq!(greeting.finished(), Finished::Failed);
        let err = greeting.get_result_state().unwrap_err();
        assert!(err.to_string().starts_with("OperationFailed"));

        greeting.fail("again");
        assert_eq!(greeting.get_result_state().unwrap_err(), err);
        assert!(!greeting.recv(b"ignored", "2").unwrap());
    }

    #[test]
    fn test_quit_discloses_key() {
        let (done, _) = started(&["1", "2"]);
        let prior = done[0].get_result_state().unwrap();
        let mut leaving = Greeting::new(done[0].ctx.clone(), Some(prior.as_ref())).unwrap();
        let msg = leaving.quit().unwrap();
        assert_eq!(msg.greet_type, GreetType::QuitDown);
        assert!(msg.signing_key.is_some());
        assert_eq!(leaving.state(), GreetingState::Quit);
        assert!(leaving.quit().is_err());
    }

    #[test]
    fn test_wrong_sender_rejected() {
        let ctxs = contexts(&["1", "2"]);
        let mut first = Greeting::new(ctxs[0].clone(), None).unwrap();
        let mut second = Greeting::new(ctxs[1].clone(), None).unwrap();
        let msg = first.start(&names(&["2"])).unwrap();
        let packet = first.encode(&msg).unwrap();
        assert!(matches!(second.recv(&packet, "2"), Err(GreetError::SignatureInvalid(_))));
        assert_eq!(second.finished(), Finished::Failed);
    }

    #[test]
    fn test_tampered_packet_fails_operation() {
        let ctxs = contexts(&["1", "2"]);
        let mut first = Greeting::new(ctxs[0].clone(), None).unwrap();
        let mut second = Greeting::new(ctxs[1].clone(), None).unwrap();
        let msg = first.start(&names(&["2"])).unwrap();
        let mut packet = first.encode(&msg).unwrap();
        // first signature byte, after the version and message type records
        packet[14] ^= 0x01;

        assert_eq!(
            second.recv(&packet, "1"),
            Err(GreetError::SignatureInvalid("1".to_string()))
        );
        assert_eq!(second.finished(), Finished::Failed);
        assert!(matches!(
            second.completion().outcome(),
            Some(Err(GreetError::SignatureInvalid(ref who))) if who == "1"
        ));
        // a failed greeting ignores anything further
        assert_eq!(second.recv(&first.encode(&msg).unwrap(), "1"), Ok(false));
    }

    #[test]
    fn test_unknown_sender_fails_operation() {
        let ctxs = contexts(&["1", "2"]);
        let strangers = contexts(&["9"]);
        let mut second = Greeting::new(ctxs[1].clone(), None).unwrap();
        let mut stranger = Greeting::new(strangers[0].clone(), None).unwrap();
        let msg = stranger.start(&names(&["2"])).unwrap();
        let packet = stranger.encode(&msg).unwrap();

        assert!(second.recv(&packet, "9").is_err());
        assert_eq!(second.finished(), Finished::Failed);
    }

    #[tokio::test]
    async fn test_completion_resolves() {
        let ctx = contexts(&["1", "2"]).remove(0);
        let mut greeting = Greeting::new(ctx, None).unwrap();
        let completion = greeting.completion();
        assert!(completion.outcome().is_none());

        let seen = Arc::new(Mutex::new(0));
        let s = seen.clone();
        greeting.on_complete(move |_| {
            *s.lock().unwrap() += 1;
            Ok(())
        });
        greeting.fail("stop");
        greeting.fail("stop again");
        assert!(matches!(completion.wait().await, Err(GreetError::OperationFailed(_))));
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
