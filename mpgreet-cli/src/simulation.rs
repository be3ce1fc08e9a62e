//! In-process group of greeters sharing one broadcast channel

use anyhow::{anyhow, bail, Context, Result};
use mpgreet_core::config::Config;
use mpgreet_core::core_async::{Monitor, MonitorState, Timer, TokioTimer};
use mpgreet_core::core_crypto::{Digest, GreetSigningKey};
use mpgreet_core::core_greet::{
    determine_flow_type, packet_id, GreetContext, GreetStore, Greeter, GreetingHandle,
    GreetingMetadata, MemoryDirectory, PubKeyDirectory,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

type Queue = Arc<Mutex<VecDeque<(String, Vec<u8>)>>>;

struct Participant {
    greeter: Greeter,
    prior: Option<Arc<GreetStore>>,
    members: BTreeSet<String>,
    current: Option<GreetingHandle>,
}

#[derive(Default)]
struct Channel {
    participants: BTreeMap<String, Participant>,
    audience: BTreeSet<String>,
    last_final: Digest,
    delivered: usize,
}

/// What one operation left behind
#[derive(Debug, Serialize)]
pub struct StepReport {
    pub operation: String,
    pub proposer: String,
    pub members: Vec<String>,
    pub packets: usize,
    pub group_key: Option<String>,
    pub excluded: Vec<String>,
}

pub struct Simulation {
    channel: Arc<Mutex<Channel>>,
    queue: Queue,
    timer: Arc<TokioTimer>,
    config: Config,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| anyhow!("simulation lock poisoned"))
}

impl Simulation {
    pub fn new(ids: &[String], config: Config, tick: Duration) -> Result<Self> {
        let directory = MemoryDirectory::new();
        let mut keys = Vec::with_capacity(ids.len());
        for id in ids {
            let key = GreetSigningKey::generate();
            directory.insert(id.clone(), key.verifying_key())?;
            keys.push(key);
        }
        let directory: Arc<dyn PubKeyDirectory> = Arc::new(directory);

        let mut channel = Channel::default();
        for (id, key) in ids.iter().zip(keys) {
            let ctx = GreetContext::new(id.clone(), key, Arc::clone(&directory))
                .with_silence_illegal_types(config.protocol.silence_illegal_greet_types);
            channel.participants.insert(
                id.clone(),
                Participant {
                    greeter: Greeter::with_context(ctx),
                    prior: None,
                    members: BTreeSet::from([id.clone()]),
                    current: None,
                },
            );
        }

        Ok(Self {
            channel: Arc::new(Mutex::new(channel)),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            timer: Arc::new(TokioTimer::new(tick)?),
            config,
        })
    }

    /// Propose `new_members` from `proposer` and deliver packets until quiet
    pub async fn run(&self, proposer: &str, new_members: &BTreeSet<String>) -> Result<StepReport> {
        let (old, flow) = {
            let mut channel = lock(&self.channel)?;
            let last = channel.last_final;
            let metadata = GreetingMetadata::create(last, last, proposer, [last]);
            let participant = channel
                .participants
                .get_mut(proposer)
                .with_context(|| format!("unknown participant {}", proposer))?;
            let old = participant.members.clone();
            let (flow, _) = determine_flow_type(proposer, &old, new_members)?;
            let packet = participant
                .greeter
                .encode(participant.prior.as_deref(), Some(&old), new_members, metadata)?;
            channel.audience = old.union(new_members).cloned().collect();
            channel.delivered = 0;
            lock(&self.queue)?.push_back((proposer.to_string(), packet));
            (old, flow)
        };
        info!("{} runs {} over {:?}", proposer, flow, new_members);

        let channel = Arc::clone(&self.channel);
        let queue = Arc::clone(&self.queue);
        let timer: Arc<dyn Timer> = self.timer.clone();
        let intervals = self.config.monitor.intervals(self.timer.tick());
        let monitor = Monitor::new(timer, intervals, move || deliver_batch(&channel, &queue));
        while monitor.state() != MonitorState::Stopped {
            tokio::time::sleep(self.timer.tick()).await;
        }
        if !lock(&self.queue)?.is_empty() {
            bail!(
                "{} did not settle after {} delivery attempts",
                flow,
                self.config.monitor.attempts
            );
        }

        let mut channel = lock(&self.channel)?;
        let audience = channel.audience.clone();
        let mut group_key = None;
        let mut excluded = Vec::new();
        for id in &audience {
            let Some(participant) = channel.participants.get_mut(id) else { continue };
            let Some(handle) = &participant.current else { continue };
            let outcome = lock(handle)?.completion().outcome();
            match outcome {
                Some(Ok(store)) => {
                    group_key = Some(hex::encode(store.group_key()?));
                    participant.members = store.member_set();
                    participant.prior = Some(store);
                }
                Some(Err(e)) if !new_members.contains(id) => {
                    debug!("{} left the session: {}", id, e);
                    excluded.push(id.clone());
                }
                Some(Err(e)) => bail!("{} failed {}: {}", id, flow, e),
                None => bail!("{} never finished {}", id, flow),
            }
        }
        debug!("{} was previously {:?}", proposer, old);

        Ok(StepReport {
            operation: flow.name().to_string(),
            proposer: proposer.to_string(),
            members: new_members.iter().cloned().collect(),
            packets: channel.delivered,
            group_key,
            excluded,
        })
    }
}

/// Deliver everything queued so far; `Ok(true)` once nothing is left
fn deliver_batch(channel: &Mutex<Channel>, queue: &Queue) -> Result<bool> {
    let batch: Vec<(String, Vec<u8>)> = lock(queue)?.drain(..).collect();
    let mut channel = lock(channel)?;
    for (sender, packet) in batch {
        channel.delivered += 1;
        let audience = channel.audience.clone();
        for id in &audience {
            deliver(&mut channel, queue, id, &sender, &packet)?;
        }
    }
    Ok(lock(queue)?.is_empty())
}

fn deliver(
    channel: &mut Channel,
    queue: &Queue,
    id: &str,
    sender: &str,
    packet: &[u8],
) -> Result<()> {
    let pid = packet_id(packet);
    let participant = channel
        .participants
        .get_mut(id)
        .with_context(|| format!("unknown participant {}", id))?;
    let summary = participant
        .greeter
        .partial_decode(Some(&participant.members), packet, sender, || pid)?;

    if summary.as_ref().is_some_and(|s| s.is_final()) {
        channel.last_final = pid;
    }
    if summary.as_ref().is_some_and(|s| s.is_initial()) {
        let handle = participant.greeter.decode(
            participant.prior.as_deref(),
            Some(&participant.members),
            packet,
            sender,
            pid,
        )?;
        let queue = Arc::clone(queue);
        let own = id.to_string();
        lock(&handle)?.on_send(move |item| {
            lock(&queue)?.push_back((own.clone(), item.packet.clone()));
            Ok(())
        });
        participant.current = Some(handle);
    }

    if let Some(handle) = &participant.current {
        lock(handle)?.recv(packet, sender)?;
    }
    Ok(())
}
