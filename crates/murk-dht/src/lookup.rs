//! Iterative Kademlia lookup.
//!
//! Repeatedly queries the alpha closest unqueried nodes for their own
//! closest nodes to the target, merging results, until a round yields
//! nothing closer than the current best or the round bound is hit. A node
//! is never queried twice within one lookup; nodes that never reply are
//! timed out and excluded.

use std::collections::HashSet;
use std::net::SocketAddr;

use murk_core::NodeId;

use crate::{DEFAULT_ALPHA, DEFAULT_K, MAX_LOOKUP_ROUNDS};

/// A lookup candidate: identity and address.
pub type Candidate = (NodeId, SocketAddr);

/// Progress of a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStatus {
    /// Queries outstanding or further rounds possible
    InProgress,
    /// Converged: no closer node found, or round bound reached
    Complete,
}

/// One in-flight iterative lookup.
pub struct Lookup {
    target: NodeId,
    /// Known candidates, ascending by distance to target, capped at k
    candidates: Vec<Candidate>,
    queried: HashSet<NodeId>,
    pending: HashSet<NodeId>,
    rounds: usize,
    improved: bool,
    best_distance: Option<[u8; 32]>,
    k: usize,
    alpha: usize,
    max_rounds: usize,
    done: bool,
}

impl Lookup {
    /// Creates a lookup seeded from the local routing table.
    pub fn new(target: NodeId, seeds: Vec<Candidate>) -> Self {
        Self::with_params(target, seeds, DEFAULT_K, DEFAULT_ALPHA, MAX_LOOKUP_ROUNDS)
    }

    /// Creates a lookup with explicit parameters.
    pub fn with_params(
        target: NodeId,
        seeds: Vec<Candidate>,
        k: usize,
        alpha: usize,
        max_rounds: usize,
    ) -> Self {
        let mut lookup = Self {
            target,
            candidates: Vec::new(),
            queried: HashSet::new(),
            pending: HashSet::new(),
            rounds: 0,
            improved: false,
            best_distance: None,
            k,
            alpha,
            max_rounds,
            done: false,
        };
        for (node_id, addr) in seeds {
            lookup.merge(node_id, addr);
        }
        // Seeds set the starting bar, they are not an improvement.
        lookup.improved = false;
        lookup
    }

    /// Returns the lookup target.
    pub fn target(&self) -> &NodeId {
        &self.target
    }

    /// Returns the lookup status.
    pub fn status(&self) -> LookupStatus {
        if self.done {
            LookupStatus::Complete
        } else {
            LookupStatus::InProgress
        }
    }

    /// Returns true when all queries of the current round have resolved.
    pub fn round_complete(&self) -> bool {
        self.pending.is_empty()
    }

    /// Returns the next batch of nodes to query, or empty when the lookup
    /// has converged.
    ///
    /// Rounds are serial: a new batch is only issued once every query of
    /// the previous round has been answered or timed out.
    pub fn next_batch(&mut self) -> Vec<Candidate> {
        if self.done || !self.pending.is_empty() {
            return Vec::new();
        }

        // Converged: the previous round found nothing closer.
        if self.rounds > 0 && !self.improved {
            self.done = true;
            return Vec::new();
        }
        if self.rounds >= self.max_rounds {
            self.done = true;
            return Vec::new();
        }

        let batch: Vec<Candidate> = self
            .candidates
            .iter()
            .filter(|(id, _)| !self.queried.contains(id))
            .take(self.alpha)
            .cloned()
            .collect();

        if batch.is_empty() {
            self.done = true;
            return Vec::new();
        }

        for (id, _) in &batch {
            self.queried.insert(*id);
            self.pending.insert(*id);
        }
        self.rounds += 1;
        self.improved = false;
        batch
    }

    /// Feeds a response from a queried node.
    pub fn on_response(&mut self, from: &NodeId, nodes: &[Candidate]) {
        self.pending.remove(from);
        for (node_id, addr) in nodes {
            self.merge(*node_id, *addr);
        }
    }

    /// Excludes a node that never replied.
    pub fn on_timeout(&mut self, from: &NodeId) {
        self.pending.remove(from);
    }

    /// Returns the closest known candidates, ascending by distance.
    pub fn result(&self) -> Vec<Candidate> {
        self.candidates.clone()
    }

    /// Returns how many rounds have been issued.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    fn merge(&mut self, node_id: NodeId, addr: SocketAddr) {
        if self.candidates.iter().any(|(id, _)| *id == node_id) {
            return;
        }

        let distance = self.target.xor_distance(&node_id);
        match &self.best_distance {
            Some(best) if distance < *best => {
                self.best_distance = Some(distance);
                self.improved = true;
            }
            None => {
                self.best_distance = Some(distance);
                self.improved = true;
            }
            _ => {}
        }

        self.candidates.push((node_id, addr));
        let target = self.target;
        self.candidates.sort_by(|a, b| {
            let dist_a = target.xor_distance(&a.0);
            let dist_b = target.xor_distance(&b.0);
            dist_a.cmp(&dist_b)
        });
        self.candidates.truncate(self.k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_first_batch_is_alpha_closest() {
        let target = NodeId::new([0xFF; 32]);
        let seeds: Vec<Candidate> = (1..=6u8)
            .map(|i| (NodeId::new([i; 32]), addr(i as u16)))
            .collect();

        let mut lookup = Lookup::with_params(target, seeds, 8, 4, 8);
        let batch = lookup.next_batch();
        assert_eq!(batch.len(), 4);

        // No re-issue while queries are outstanding.
        assert!(lookup.next_batch().is_empty());
        assert_eq!(lookup.status(), LookupStatus::InProgress);
    }

    #[test]
    fn test_never_queries_same_node_twice() {
        let target = NodeId::new([0xFF; 32]);
        let seed = (NodeId::new([0x01; 32]), addr(1));
        let mut lookup = Lookup::with_params(target, vec![seed], 8, 4, 8);

        let batch = lookup.next_batch();
        assert_eq!(batch.len(), 1);
        let queried = batch[0].0;

        // Response re-advertises the queried node itself.
        lookup.on_response(&queried, &[(queried, addr(1))]);

        while lookup.status() == LookupStatus::InProgress {
            for (id, _) in lookup.next_batch() {
                assert_ne!(id, queried, "node queried twice");
                lookup.on_response(&id, &[]);
            }
        }
    }

    #[test]
    fn test_converges_when_no_closer_found() {
        let target = NodeId::new([0xFF; 32]);
        let seeds: Vec<Candidate> = (1..=4u8)
            .map(|i| (NodeId::new([i; 32]), addr(i as u16)))
            .collect();
        let mut lookup = Lookup::with_params(target, seeds, 8, 4, 8);

        // Round 1: responses add nothing new.
        for (id, _) in lookup.next_batch() {
            lookup.on_response(&id, &[]);
        }
        assert!(lookup.next_batch().is_empty());
        assert_eq!(lookup.status(), LookupStatus::Complete);
    }

    #[test]
    fn test_closer_nodes_extend_the_search() {
        let target = NodeId::new([0xFF; 32]);
        let far = (NodeId::new([0x01; 32]), addr(1));
        let near_id = NodeId::new([0xFE; 32]);
        let mut lookup = Lookup::with_params(target, vec![far], 8, 4, 8);

        let batch = lookup.next_batch();
        lookup.on_response(&batch[0].0, &[(near_id, addr(2))]);

        // The closer node triggers another round.
        let batch2 = lookup.next_batch();
        assert_eq!(batch2.len(), 1);
        assert_eq!(batch2[0].0, near_id);
    }

    #[test]
    fn test_timeouts_exclude_nodes() {
        let target = NodeId::new([0xFF; 32]);
        let seeds: Vec<Candidate> = (1..=3u8)
            .map(|i| (NodeId::new([i; 32]), addr(i as u16)))
            .collect();
        let mut lookup = Lookup::with_params(target, seeds, 8, 4, 8);

        for (id, _) in lookup.next_batch() {
            lookup.on_timeout(&id);
        }
        assert!(lookup.round_complete());
        // All timed out, nothing improved: converged with what we had.
        assert!(lookup.next_batch().is_empty());
        assert_eq!(lookup.status(), LookupStatus::Complete);
    }

    #[test]
    fn test_round_bound() {
        let target = NodeId::new([0xFF; 32]);
        let mut next = [0u8; 32];
        next[0] = 1;
        let mut lookup =
            Lookup::with_params(target, vec![(NodeId::new(next), addr(1))], 8, 1, 3);

        // Every response advertises a strictly closer node, forever.
        let mut byte = 1u8;
        let mut issued = 0;
        loop {
            let batch = lookup.next_batch();
            if batch.is_empty() {
                break;
            }
            issued += 1;
            byte = byte.saturating_add(20);
            let mut closer = [0u8; 32];
            closer[0] = byte;
            lookup.on_response(&batch[0].0, &[(NodeId::new(closer), addr(byte as u16))]);
        }

        assert_eq!(issued, 3);
        assert_eq!(lookup.status(), LookupStatus::Complete);
    }

    #[test]
    fn test_sparse_result_is_valid() {
        let target = NodeId::random();
        let mut lookup = Lookup::with_params(target, Vec::new(), 8, 4, 8);
        assert!(lookup.next_batch().is_empty());
        assert_eq!(lookup.status(), LookupStatus::Complete);
        assert!(lookup.result().is_empty());
    }
}
