//! Pending operation queue
//!
//! Operations are sent in submission order and completed in submission
//! order. An entry may be resolved early (a write refused locally while
//! read-only) but its caller only hears back once every earlier entry has
//! completed.
//!
//! The queue holds at most `capacity` caller operations; pings do not count.

use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::protocol::{OpResult, Operation, Reply, Request};

use super::errors::{ClientError, ClientResult};

pub type ReplySender = oneshot::Sender<ClientResult<OpResult>>;

struct PendingOp {
    xid: i32,
    op: Operation,
    /// `None` for internal operations (pings)
    reply: Option<ReplySender>,
    outcome: Option<ClientResult<OpResult>>,
    sent: bool,
}

impl PendingOp {
    fn abandoned(&self) -> bool {
        self.reply.as_ref().map_or(false, |reply| reply.is_closed())
    }
}

/// What a dispatch pass produced.
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Requests to write, in order
    pub requests: Vec<Request>,
    /// Writes refused because the connection is read-only
    pub rejected_read_only: usize,
}

pub struct PendingQueue {
    entries: VecDeque<PendingOp>,
    capacity: usize,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, xid: i32, op: Operation, reply: Option<ReplySender>) {
        self.entries.push_back(PendingOp {
            xid,
            op,
            reply,
            outcome: None,
            sent: false,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True once `capacity` caller operations are waiting.
    pub fn is_full(&self) -> bool {
        self.entries
            .iter()
            .filter(|entry| entry.reply.is_some())
            .count()
            >= self.capacity
    }

    /// True if a ping is already queued or in flight.
    pub fn has_ping(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.outcome.is_none() && matches!(entry.op, Operation::Ping))
    }

    /// Mark every unsent entry as sent and return the requests to write.
    /// On a read-only connection writes are resolved `NotReadOnly` instead.
    /// Entries whose caller gave up are dropped unsent.
    pub fn dispatch(&mut self, read_only: bool) -> Dispatch {
        let mut dispatch = Dispatch::default();
        for entry in self.entries.iter_mut() {
            if entry.sent || entry.outcome.is_some() {
                continue;
            }
            if entry.abandoned() {
                entry.outcome = Some(Err(ClientError::ConnectionLoss));
            } else if read_only && entry.op.is_mutating() {
                entry.outcome = Some(Err(ClientError::NotReadOnly));
                dispatch.rejected_read_only += 1;
            } else {
                entry.sent = true;
                dispatch.requests.push(Request {
                    xid: entry.xid,
                    op: entry.op.clone(),
                });
            }
        }
        self.flush();
        dispatch
    }

    /// Match a reply to the oldest in-flight entry.
    ///
    /// Returns the number of caller operations completed, or the reply xid
    /// if it does not belong to the oldest in-flight entry.
    pub fn complete(&mut self, reply: Reply) -> Result<usize, i32> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.sent && entry.outcome.is_none())
            .ok_or(reply.xid)?;
        if entry.xid != reply.xid {
            return Err(reply.xid);
        }
        entry.outcome = Some(reply.result.map_err(ClientError::from_error_code));
        Ok(self.flush())
    }

    /// Connection lost. Pings are dropped. A write that was sent but not
    /// answered may or may not have been applied, so it fails with
    /// `ConnectionLoss`. Unanswered reads and unsent entries are replayed
    /// in order on the next connection.
    ///
    /// Returns the number of writes failed.
    pub fn requeue_in_flight(&mut self) -> usize {
        self.entries
            .retain(|entry| entry.outcome.is_some() || !entry.op.is_internal());
        let mut lost = 0;
        for entry in self.entries.iter_mut() {
            if !entry.sent || entry.outcome.is_some() {
                continue;
            }
            if entry.op.is_mutating() {
                entry.outcome = Some(Err(ClientError::ConnectionLoss));
                lost += 1;
            } else {
                entry.sent = false;
            }
        }
        self.flush();
        lost
    }

    /// Drop unsent entries whose caller gave up. Sent entries stay until
    /// their reply arrives so replies keep matching in order.
    pub fn prune_abandoned(&mut self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|entry| entry.sent || entry.outcome.is_some() || !entry.abandoned());
        let pruned = before - self.entries.len();
        self.flush();
        pruned
    }

    /// Resolve everything still waiting with `error`.
    pub fn fail_all(&mut self, error: ClientError) {
        for entry in self.entries.drain(..) {
            if let Some(reply) = entry.reply {
                let _ = reply.send(entry.outcome.unwrap_or_else(|| Err(error.clone())));
            }
        }
    }

    /// Deliver resolved entries from the front. Returns how many callers
    /// were answered.
    fn flush(&mut self) -> usize {
        let mut delivered = 0;
        while self
            .entries
            .front()
            .map_or(false, |entry| entry.outcome.is_some())
        {
            let Some(entry) = self.entries.pop_front() else {
                break;
            };
            if let (Some(reply), Some(outcome)) = (entry.reply, entry.outcome) {
                if reply.send(outcome).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}
