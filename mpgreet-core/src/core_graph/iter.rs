//! Breadth-first and topological traversal

use super::errors::{GraphError, GraphResult};
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use tracing::debug;

/// Breadth-first traversal visiting each node once, in discovery order
pub struct BfIterator<N, F> {
    queue: VecDeque<N>,
    seen: HashSet<N>,
    successors: F,
}

pub fn bf_iterator<N, F, I>(roots: I, successors: F) -> BfIterator<N, F>
where
    N: Clone + Eq + Hash,
    F: Fn(&N) -> Vec<N>,
    I: IntoIterator<Item = N>,
{
    let mut seen = HashSet::new();
    let queue = roots.into_iter().filter(|n| seen.insert(n.clone())).collect();
    BfIterator { queue, seen, successors }
}

impl<N, F> Iterator for BfIterator<N, F>
where
    N: Clone + Eq + Hash,
    F: Fn(&N) -> Vec<N>,
{
    type Item = N;

    fn next(&mut self) -> Option<N> {
        let node = self.queue.pop_front()?;
        for next in (self.successors)(&node) {
            if self.seen.insert(next.clone()) {
                self.queue.push_back(next);
            }
        }
        Some(node)
    }
}

type NodesFn<'a, N> = Box<dyn Fn(&N) -> Vec<N> + 'a>;

/// Topological traversal that stops at rejected nodes
///
/// A node is visited once every predecessor that descends from one of the
/// roots has been visited. Nodes below a rejected node are never yielded.
/// Without `inclusive`, the accepted nodes are yielded; with it, the
/// rejected nodes on the boundary are yielded instead.
pub struct BfTopoIterator<'a, N> {
    roots: Vec<N>,
    successors: NodesFn<'a, N>,
    predecessors: NodesFn<'a, N>,
    le: Box<dyn Fn(&N, &N) -> bool + 'a>,
    accept: Box<dyn Fn(&N) -> bool + 'a>,
    inclusive: bool,
    ready: VecDeque<N>,
    // discovered nodes with the number of predecessors still unvisited
    pending: HashMap<N, usize>,
    visited: HashSet<N>,
    blocked: HashSet<N>,
    done: bool,
}

pub fn bf_topo_iterator<'a, N, I, S, P, L, A>(
    roots: I,
    successors: S,
    predecessors: P,
    le: L,
    accept: A,
    inclusive: bool,
) -> BfTopoIterator<'a, N>
where
    N: Clone + Eq + Hash,
    I: IntoIterator<Item = N>,
    S: Fn(&N) -> Vec<N> + 'a,
    P: Fn(&N) -> Vec<N> + 'a,
    L: Fn(&N, &N) -> bool + 'a,
    A: Fn(&N) -> bool + 'a,
{
    let mut unique = HashSet::new();
    let roots: Vec<N> = roots.into_iter().filter(|n| unique.insert(n.clone())).collect();
    let mut iter = BfTopoIterator {
        roots: roots.clone(),
        successors: Box::new(successors),
        predecessors: Box::new(predecessors),
        le: Box::new(le),
        accept: Box::new(accept),
        inclusive,
        ready: VecDeque::new(),
        pending: HashMap::new(),
        visited: HashSet::new(),
        blocked: HashSet::new(),
        done: false,
    };
    for root in roots {
        iter.discover(root);
    }
    iter
}

impl<'a, N: Clone + Eq + Hash> BfTopoIterator<'a, N> {
    fn in_scope(&self, node: &N) -> bool {
        self.roots.iter().any(|r| (self.le)(r, node))
    }

    fn discover(&mut self, node: N) {
        if self.visited.contains(&node) || self.pending.contains_key(&node) {
            return;
        }
        let waiting = (self.predecessors)(&node)
            .iter()
            .filter(|p| self.in_scope(p))
            .count();
        if waiting == 0 {
            self.ready.push_back(node);
        } else {
            self.pending.insert(node, waiting);
        }
    }

    fn release_successors(&mut self, node: &N, blocked: bool) {
        let counts = self.in_scope(node);
        for next in (self.successors)(node) {
            if self.visited.contains(&next) {
                continue;
            }
            if blocked {
                self.blocked.insert(next.clone());
            }
            if !self.pending.contains_key(&next) {
                self.discover(next.clone());
                if !self.pending.contains_key(&next) {
                    continue;
                }
            }
            if !counts {
                continue;
            }
            let remaining = self.pending.get_mut(&next).map(|c| {
                *c = c.saturating_sub(1);
                *c
            });
            if remaining == Some(0) {
                self.pending.remove(&next);
                self.ready.push_back(next);
            }
        }
    }
}

impl<'a, N: Clone + Eq + Hash> Iterator for BfTopoIterator<'a, N> {
    type Item = GraphResult<N>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        while let Some(node) = self.ready.pop_front() {
            if !self.visited.insert(node.clone()) {
                continue;
            }
            if self.blocked.contains(&node) {
                self.release_successors(&node, true);
                continue;
            }
            let accepted = (self.accept)(&node);
            self.release_successors(&node, !accepted);
            if accepted != self.inclusive {
                return Some(Ok(node));
            }
        }

        self.done = true;
        if self.pending.is_empty() {
            None
        } else {
            debug!("Topological traversal stuck with {} pending nodes", self.pending.len());
            Some(Err(GraphError::Cycle { pending: self.pending.len() }))
        }
    }
}
