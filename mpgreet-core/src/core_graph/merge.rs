//! Multi-parent state merge over a causal history
//!
//! The state at a set of heads is computed by folding the heads together
//! with 3-way merges. The base of each merge is the merged state of the
//! maximal common ancestors of the heads folded so far and the next head,
//! which is itself a merge over a smaller head set. Results are memoized per
//! head set and evaluation runs on an explicit stack, so arbitrarily long
//! histories do not grow the call stack.

use super::errors::{GraphError, GraphResult};
use super::iter::{bf_iterator, BfIterator};
use crate::metrics::{self as greet_metrics, names};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use tracing::trace;

type NodesFn<'a, N> = Box<dyn Fn(&N) -> Vec<N> + 'a>;

/// Build a successor map from a predecessor map, or the other way round
///
/// Every node mentioned only as a neighbour gets an empty entry.
pub fn invert_successor_map<N: Clone + Ord>(map: &BTreeMap<N, Vec<N>>) -> BTreeMap<N, Vec<N>> {
    let mut inverted: BTreeMap<N, Vec<N>> = map.keys().map(|k| (k.clone(), Vec::new())).collect();
    for (node, neighbours) in map {
        for n in neighbours {
            inverted.entry(n.clone()).or_default().push(node.clone());
        }
    }
    inverted
}

/// Progress of folding one head set
struct Frame<N, S> {
    key: Vec<N>,
    next: usize,
    acc: Option<S>,
}

impl<N, S> Frame<N, S> {
    fn new(key: Vec<N>) -> Self {
        Self { key, next: 0, acc: None }
    }
}

enum Step<N, S> {
    Done(S),
    Need(Vec<N>),
    Advance(S),
}

/// Computes the merged state at any set of heads
pub struct Merger<'a, N, S> {
    successors: NodesFn<'a, N>,
    predecessors: NodesFn<'a, N>,
    le: Box<dyn Fn(&N, &N) -> bool + 'a>,
    state: Box<dyn Fn(&N) -> S + 'a>,
    empty: S,
    merge3: Box<dyn Fn(&S, &S, &S) -> S + 'a>,
    cache: HashMap<Vec<N>, S>,
}

impl<'a, N, S> Merger<'a, N, S>
where
    N: Clone + Ord + Hash,
    S: Clone,
{
    /// # Arguments
    ///
    /// * `successors` / `predecessors` - graph structure
    /// * `le` - whether the first node is an ancestor of, or equal to, the second
    /// * `state` - state at a single node
    /// * `empty` - state below every root
    /// * `merge3` - `merge3(base, a, b)` merges `a` and `b` that diverged from `base`
    pub fn new<SF, PF, LF, TF, MF>(
        successors: SF,
        predecessors: PF,
        le: LF,
        state: TF,
        empty: S,
        merge3: MF,
    ) -> Self
    where
        SF: Fn(&N) -> Vec<N> + 'a,
        PF: Fn(&N) -> Vec<N> + 'a,
        LF: Fn(&N, &N) -> bool + 'a,
        TF: Fn(&N) -> S + 'a,
        MF: Fn(&S, &S, &S) -> S + 'a,
    {
        Self {
            successors: Box::new(successors),
            predecessors: Box::new(predecessors),
            le: Box::new(le),
            state: Box::new(state),
            empty,
            merge3: Box::new(merge3),
            cache: HashMap::new(),
        }
    }

    /// Nodes reachable from `node` through successors, itself included
    pub fn descendants(&self, node: N) -> BfIterator<N, impl Fn(&N) -> Vec<N> + '_> {
        bf_iterator([node], move |n: &N| (self.successors)(n))
    }

    /// Number of memoized head sets
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Sorted heads with every node that is an ancestor of another removed
    fn antichain(&self, heads: &[N]) -> Vec<N> {
        let mut unique: Vec<N> = heads.to_vec();
        unique.sort();
        unique.dedup();
        unique
            .iter()
            .filter(|h| !unique.iter().any(|o| o != *h && (self.le)(h, o)))
            .cloned()
            .collect()
    }

    /// Maximal nodes below `head` that are ancestors of some node in `acc`
    fn common_ancestors(&self, acc: &[N], head: &N) -> Vec<N> {
        let mut found = Vec::new();
        let mut seen: HashSet<N> = HashSet::new();
        let mut queue: VecDeque<N> = VecDeque::new();
        for p in (self.predecessors)(head) {
            if seen.insert(p.clone()) {
                queue.push_back(p);
            }
        }
        while let Some(node) = queue.pop_front() {
            if acc.iter().any(|a| (self.le)(&node, a)) {
                found.push(node);
                continue;
            }
            for p in (self.predecessors)(&node) {
                if seen.insert(p.clone()) {
                    queue.push_back(p);
                }
            }
        }
        self.antichain(&found)
    }

    fn step(&self, frame: &Frame<N, S>) -> Step<N, S> {
        let Some(acc) = &frame.acc else {
            return match frame.key.first() {
                Some(first) => Step::Advance((self.state)(first)),
                None => Step::Done(self.empty.clone()),
            };
        };
        let Some(head) = frame.key.get(frame.next) else {
            return Step::Done(acc.clone());
        };

        let base_key = self.common_ancestors(&frame.key[..frame.next], head);
        let base = if base_key.is_empty() {
            self.empty.clone()
        } else {
            match self.cache.get(&base_key) {
                Some(base) => base.clone(),
                None => return Step::Need(base_key),
            }
        };
        Step::Advance((self.merge3)(&base, acc, &(self.state)(head)))
    }

    /// Merged state at `heads`
    ///
    /// # Errors
    ///
    /// [`GraphError::Cycle`] if computing the merge depends on itself, which
    /// only happens when the history contains a cycle.
    pub fn merge(&mut self, heads: &[N]) -> GraphResult<S> {
        let key = self.antichain(heads);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }

        let timer = greet_metrics::Timer::new(names::MERGE_DURATION_MS);
        let mut stack: Vec<Frame<N, S>> = vec![Frame::new(key.clone())];
        let mut active: HashSet<Vec<N>> = HashSet::from([key.clone()]);

        while let Some(frame) = stack.last_mut() {
            match self.step(frame) {
                Step::Advance(acc) => {
                    frame.next += 1;
                    frame.acc = Some(acc);
                }
                Step::Done(result) => {
                    let finished = stack.pop().map(|f| f.key);
                    if let Some(done_key) = finished {
                        active.remove(&done_key);
                        self.cache.insert(done_key, result);
                    }
                }
                Step::Need(base_key) => {
                    if !active.insert(base_key.clone()) {
                        return Err(GraphError::Cycle { pending: stack.len() });
                    }
                    trace!("Merge needs base of {} heads first", base_key.len());
                    stack.push(Frame::new(base_key));
                }
            }
        }

        timer.stop();
        greet_metrics::record_counter(names::MERGES_COMPUTED, 1);
        self.cache
            .get(&key)
            .cloned()
            .ok_or(GraphError::Cycle { pending: 0 })
    }
}
