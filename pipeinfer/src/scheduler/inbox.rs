//! Per-node buffering of upstream edges

use std::collections::VecDeque;

use super::EdgeMessage;

/// Local buffers in front of a pipelined node, one per upstream edge.
///
/// A node first waits until every upstream has delivered something or
/// closed, so a join starts with input from all sides. That barrier is
/// lifted early once any buffer fills up: an upstream that filters out
/// everything must not stall its siblings forever. After the barrier the
/// node is ready whenever any buffer holds a message, and chunks are taken
/// round-robin so no edge starves.
pub(crate) struct Inbox<T> {
    buffers: Vec<VecDeque<EdgeMessage<T>>>,
    open: Vec<bool>,
    seen: Vec<bool>,
    streaming: bool,
    capacity: usize,
    cursor: usize,
}

impl<T> Inbox<T> {
    pub(crate) fn new(edges: usize, capacity: usize) -> Self {
        Self {
            buffers: (0..edges).map(|_| VecDeque::new()).collect(),
            open: vec![true; edges],
            seen: vec![false; edges],
            streaming: false,
            capacity: capacity.max(1),
            cursor: 0,
        }
    }

    pub(crate) fn push(&mut self, edge: usize, message: EdgeMessage<T>) {
        self.seen[edge] = true;
        self.buffers[edge].push_back(message);
    }

    pub(crate) fn close(&mut self, edge: usize) {
        self.open[edge] = false;
    }

    /// Whether the edge is open and its buffer has room
    pub(crate) fn wants(&self, edge: usize) -> bool {
        self.open[edge] && self.buffers[edge].len() < self.capacity
    }

    /// Edges worth receiving from right now
    pub(crate) fn wanted(&self) -> Vec<usize> {
        (0..self.buffers.len()).filter(|&edge| self.wants(edge)).collect()
    }

    /// Every edge closed and every buffer empty
    pub(crate) fn is_drained(&self) -> bool {
        self.open.iter().all(|open| !open) && self.buffers.iter().all(VecDeque::is_empty)
    }

    pub(crate) fn is_ready(&mut self) -> bool {
        if self.is_drained() {
            return true;
        }
        if !self.streaming {
            let barrier = self.seen.iter().zip(&self.open).all(|(&seen, &open)| seen || !open);
            let full = self.buffers.iter().any(|b| b.len() >= self.capacity);
            if !(barrier || full) {
                return false;
            }
            self.streaming = true;
        }
        self.buffers.iter().any(|b| !b.is_empty())
    }

    /// Take up to `max` items round-robin.
    ///
    /// Stops at a failure marker and returns the name of the failed
    /// upstream alongside the items that came before it.
    pub(crate) fn take_chunk(&mut self, max: usize) -> (Vec<T>, Option<String>) {
        let edges = self.buffers.len();
        let mut items = Vec::new();
        let mut idle = 0;
        while items.len() < max && idle < edges {
            let edge = self.cursor;
            self.cursor = (self.cursor + 1) % edges;
            match self.buffers[edge].pop_front() {
                Some(EdgeMessage::Item(item)) => {
                    items.push(item);
                    idle = 0;
                }
                Some(EdgeMessage::Failed(upstream)) => return (items, Some(upstream)),
                None => idle += 1,
            }
        }
        (items, None)
    }
}
