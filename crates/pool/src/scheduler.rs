//! Queue, availability, and correlation bookkeeping for the worker pool.
//!
//! The scheduler is plain state: it never awaits. The pool's actor thread
//! owns one and feeds it commands and unit replies in arrival order.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::PoolError;
use crate::protocol::{ReplyBody, Request, RequestId, RequestIdGen, UnitId, UnitMessage, UnitReply};
use crate::unit::UnitHandle;

pub type CallerReply = oneshot::Sender<Result<String, PoolError>>;
pub type DirectReply = oneshot::Sender<Result<ReplyBody, PoolError>>;

/// Where the scheduler delivers messages for one unit.
pub trait UnitSink {
    fn id(&self) -> &UnitId;
    fn send(&self, message: UnitMessage) -> Result<(), PoolError>;
}

impl UnitSink for UnitHandle {
    fn id(&self) -> &UnitId {
        UnitHandle::id(self)
    }

    fn send(&self, message: UnitMessage) -> Result<(), PoolError> {
        UnitHandle::send(self, message)
    }
}

/// Work addressed to one specific unit, outside the shared queue. Used for
/// the start-up handshake and warm-up.
#[derive(Debug, Clone)]
pub enum DirectRequest {
    Configure,
    RunInline(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub units: usize,
    pub available: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub ready: bool,
}

struct Queued {
    request: Request,
    reply: CallerReply,
}

enum InFlight {
    Caller { unit: usize, reply: CallerReply },
    Direct { reply: DirectReply },
}

struct Slot<U> {
    unit: U,
    available: bool,
    gone: bool,
}

pub struct Scheduler<U> {
    units: Vec<Slot<U>>,
    queue: VecDeque<Queued>,
    in_flight: HashMap<RequestId, InFlight>,
    ids: RequestIdGen,
    debug: bool,
    ready: bool,
}

impl<U: UnitSink> Scheduler<U> {
    pub fn new(debug: bool) -> Self {
        Self {
            units: Vec::new(),
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            ids: RequestIdGen::new("req"),
            debug,
            ready: false,
        }
    }

    /// Install the unit collection. Replaces any previous units.
    pub fn register(&mut self, units: Vec<U>) {
        self.units = units
            .into_iter()
            .map(|unit| Slot {
                unit,
                available: true,
                gone: false,
            })
            .collect();
        self.ready = false;
    }

    pub fn enqueue(&mut self, request: Request, reply: CallerReply) {
        self.queue.push_back(Queued { request, reply });
        self.drain();
    }

    pub fn mark_ready(&mut self) {
        self.ready = true;
        self.drain();
    }

    /// Reject every queued request with `err`.
    pub fn fail_queued(&mut self, err: PoolError) {
        if !self.queue.is_empty() {
            tracing::debug!("rejecting {} queued requests: {}", self.queue.len(), err);
        }
        for queued in self.queue.drain(..) {
            let _ = queued.reply.send(Err(err.clone()));
        }
    }

    /// Hand queued requests to available units, first available in pool
    /// order, until either runs out. Requests whose caller stopped waiting
    /// are dropped instead of run.
    pub fn drain(&mut self) {
        if !self.ready {
            return;
        }
        while !self.queue.is_empty() {
            let Some(index) = self.units.iter().position(|slot| slot.available) else {
                break;
            };
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            if queued.reply.is_closed() {
                tracing::debug!("dropping queued request: caller went away");
                continue;
            }
            let id = self.ids.next_id();
            let message = UnitMessage::Execute {
                id: id.clone(),
                request: queued.request,
                debug: self.debug,
            };
            let slot = &mut self.units[index];
            slot.available = false;
            match slot.unit.send(message) {
                Ok(()) => {
                    tracing::debug!("dispatched {} to {}", id, slot.unit.id());
                    self.in_flight.insert(
                        id,
                        InFlight::Caller {
                            unit: index,
                            reply: queued.reply,
                        },
                    );
                }
                Err(err) => {
                    tracing::warn!("{}", err);
                    slot.gone = true;
                    let _ = queued.reply.send(Err(err));
                }
            }
        }
        if !self.units.is_empty() && self.units.iter().all(|slot| slot.gone) {
            self.fail_queued(PoolError::NotReady("no execution units left".to_string()));
        }
    }

    /// Send a request to one unit without touching its availability.
    pub fn direct(&mut self, unit: usize, request: DirectRequest, reply: DirectReply) {
        let Some(slot) = self.units.get(unit) else {
            let _ = reply.send(Err(PoolError::UnitGone(UnitId::numbered(unit).to_string())));
            return;
        };
        let id = self.ids.next_id();
        let message = match request {
            DirectRequest::Configure => UnitMessage::Configure {
                id: id.clone(),
                debug: self.debug,
            },
            DirectRequest::RunInline(code) => UnitMessage::Execute {
                id: id.clone(),
                request: Request::inline(code),
                debug: self.debug,
            },
        };
        match slot.unit.send(message) {
            Ok(()) => {
                self.in_flight.insert(id, InFlight::Direct { reply });
            }
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    /// Route a unit reply to whoever is waiting on its identity.
    pub fn complete(&mut self, reply: UnitReply) {
        let Some(entry) = self.in_flight.remove(&reply.id) else {
            tracing::debug!(
                "ignoring reply {} from {}: no pending request",
                reply.id,
                reply.unit
            );
            return;
        };
        match entry {
            InFlight::Caller { unit, reply: caller } => {
                let result = reply.result.and_then(|body| match body {
                    ReplyBody::Output(output) => Ok(output),
                    other => Err(PoolError::Protocol(format!(
                        "unexpected reply to execute: {other:?}"
                    ))),
                });
                let _ = caller.send(result);
                if let Some(slot) = self.units.get_mut(unit) {
                    slot.available = true;
                }
                self.drain();
            }
            InFlight::Direct { reply: caller } => {
                let _ = caller.send(reply.result);
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            units: self.units.len(),
            available: self.units.iter().filter(|slot| slot.available).count(),
            queued: self.queue.len(),
            in_flight: self
                .in_flight
                .values()
                .filter(|entry| matches!(entry, InFlight::Caller { .. }))
                .count(),
            ready: self.ready,
        }
    }
}
