use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use tokio::time::Instant;
use vramgate_types::{LeaseId, ResourceRequest};

use crate::lease::AcquireReply;

/// A queued acquisition.
pub(crate) struct PendingRequest {
    pub id: LeaseId,
    pub request: ResourceRequest,
    /// Arrival order; breaks priority ties FIFO.
    pub seq: u64,
    pub created_at: Instant,
    pub deadline: Option<Instant>,
    pub reply: AcquireReply,
}

impl PendingRequest {
    fn order_key(&self) -> (i32, Reverse<u64>) {
        (self.request.priority, Reverse(self.seq))
    }
}

impl PartialEq for PendingRequest {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for PendingRequest {}

impl PartialOrd for PendingRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

/// Pending requests, head = highest priority, earliest arrival.
#[derive(Default)]
pub(crate) struct LeaseQueue {
    heap: BinaryHeap<PendingRequest>,
}

impl LeaseQueue {
    pub fn push(&mut self, pending: PendingRequest) {
        self.heap.push(pending);
    }

    pub fn peek(&self) -> Option<&PendingRequest> {
        self.heap.peek()
    }

    pub fn pop(&mut self) -> Option<PendingRequest> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Take out every request whose deadline is at or before `now`.
    pub fn take_expired(&mut self, now: Instant) -> Vec<PendingRequest> {
        self.take_where(|p| is_expired(p, now))
    }

    /// Take out every request whose caller stopped waiting for the reply.
    pub fn take_abandoned(&mut self) -> Vec<PendingRequest> {
        self.take_where(|p| p.reply.is_closed())
    }

    fn take_where(&mut self, pred: impl Fn(&PendingRequest) -> bool) -> Vec<PendingRequest> {
        if !self.heap.iter().any(&pred) {
            return Vec::new();
        }
        let (taken, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .partition(|p| pred(p));
        self.heap = BinaryHeap::from(keep);
        taken
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.iter().filter_map(|p| p.deadline).min()
    }
}

fn is_expired(pending: &PendingRequest, now: Instant) -> bool {
    pending.deadline.is_some_and(|d| d <= now)
}
