//! Request/acknowledge bus between the transaction side and the writer
//! thread.
//!
//! Messages travel as [`Envelope`]s carrying a static *route*: an ordered
//! list of hops, each naming a handler and the pipe the envelope moves to
//! once the handler ran. A hop with no next pipe terminates the route. The
//! two pipes are strictly FIFO, which is what the acknowledgement-ordering
//! and cascading-rollback protocols are built on.
//!
//! Input coalescing: while a batch envelope is still queued on the
//! transaction side of the writer pipe, new write requests are appended to
//! its commit list instead of allocating a new batch.

use std::collections::VecDeque;

use crossbeam::sync::{Parker, Unparker};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::row::Row;
use crate::vclock::VClock;

/// The two endpoints messages can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeId {
    /// The writer thread.
    Wal,
    /// The transaction-side pump task.
    Tx,
}

/// Handlers a hop can name. The side owning the destination pipe runs the
/// handler, then forwards the envelope along the route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    /// Writer: append a batch to the current log.
    WriteBatch,
    /// Tx: wake committed requests, queue rolled-back ones.
    ScheduleCommit,
    /// Both sides: no-op used to drain the pipes during cascading rollback.
    ClearBus,
    /// Tx: complete the accumulated rollback queue in LIFO order.
    ScheduleRollback,
    /// Writer: leave rollback mode.
    EndRollback,
    /// Writer: copy the vclock, optionally rotate the log.
    Checkpoint,
    /// Tx: wake the checkpoint requester.
    CheckpointDone,
    /// Writer: leave the main loop.
    Stop,
}

/// One hop of a route.
#[derive(Debug, Clone, Copy)]
pub struct Hop {
    pub handler: Handler,
    pub next: Option<PipeId>,
}

/// Route of a write batch: disk write on the writer, acks on the tx side.
pub static ROUTE_WRITE: &[Hop] = &[
    Hop {
        handler: Handler::WriteBatch,
        next: Some(PipeId::Tx),
    },
    Hop {
        handler: Handler::ScheduleCommit,
        next: None,
    },
];

/// Route of a checkpoint request.
pub static ROUTE_CHECKPOINT: &[Hop] = &[
    Hop {
        handler: Handler::Checkpoint,
        next: Some(PipeId::Tx),
    },
    Hop {
        handler: Handler::CheckpointDone,
        next: None,
    },
];

/// Route of the cascading-rollback control message, pushed to the tx side by
/// the writer. The first two hops drain both pipes (the writer input valve
/// is held closed by the non-empty rollback queue while they travel); the
/// third performs the rollback on the tx side; the last reopens the writer.
pub static ROUTE_ROLLBACK: &[Hop] = &[
    Hop {
        handler: Handler::ClearBus,
        next: Some(PipeId::Wal),
    },
    Hop {
        handler: Handler::ClearBus,
        next: Some(PipeId::Tx),
    },
    Hop {
        handler: Handler::ScheduleRollback,
        next: Some(PipeId::Wal),
    },
    Hop {
        handler: Handler::EndRollback,
        next: None,
    },
];

/// Route of the shutdown message.
pub static ROUTE_STOP: &[Hop] = &[Hop {
    handler: Handler::Stop,
    next: None,
}];

/// A single write request: one-or-more rows that reach the log atomically.
#[derive(Debug)]
pub struct WalRequest {
    pub rows: Vec<Row>,
    /// Signature assigned by the writer, or -1. Written exactly once before
    /// the submitter is woken.
    pub res: i64,
    /// Completed exactly once on the tx side with the final `res`.
    pub done: Option<oneshot::Sender<i64>>,
}

impl WalRequest {
    pub fn new(rows: Vec<Row>) -> (Self, oneshot::Receiver<i64>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                rows,
                res: -1,
                done: Some(tx),
            },
            rx,
        )
    }

    /// Completes the submitter's wait. Dropped receivers are tolerated: a
    /// request is acknowledged at most once, and the result is sticky.
    pub fn complete(mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(self.res);
        }
    }
}

/// A bus message aggregating one-or-more requests for the writer.
#[derive(Debug, Default)]
pub struct Batch {
    /// Input queue; on output, the requests that committed.
    pub commit: VecDeque<WalRequest>,
    /// On output, the requests that must be rolled back.
    pub rollback: Vec<WalRequest>,
}

/// Checkpoint request payload.
#[derive(Debug)]
pub struct CheckpointMsg {
    pub rotate: bool,
    /// Filled by the writer with a copy of its vclock.
    pub vclock: VClock,
    pub done: Option<oneshot::Sender<VClock>>,
}

/// Payload of an envelope.
#[derive(Debug)]
pub enum MsgBody {
    Batch(Batch),
    Checkpoint(CheckpointMsg),
    /// Control messages travel empty; the route is the message.
    Control,
}

/// A routed message.
#[derive(Debug)]
pub struct Envelope {
    pub body: MsgBody,
    route: &'static [Hop],
    step: usize,
}

impl Envelope {
    pub fn new(body: MsgBody, route: &'static [Hop]) -> Self {
        Self {
            body,
            route,
            step: 0,
        }
    }

    /// The hop to execute next, if the route has not terminated.
    pub fn current_hop(&self) -> Option<Hop> {
        self.route.get(self.step).copied()
    }

    /// Advances past the hop just executed and returns where the envelope
    /// goes next.
    pub fn advance(&mut self) -> Option<PipeId> {
        let next = self.route.get(self.step).and_then(|hop| hop.next);
        self.step += 1;
        next
    }
}

/// The writer-side pipe: a FIFO drained by the writer thread.
pub struct WalPipe {
    queue: Mutex<VecDeque<Envelope>>,
    unparker: Unparker,
}

impl WalPipe {
    pub fn new(unparker: Unparker) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            unparker,
        }
    }

    /// Pushes an envelope and wakes the writer.
    pub fn push(&self, envelope: Envelope) {
        self.queue.lock().push_back(envelope);
        self.unparker.unpark();
    }

    /// Appends a request to the trailing batch still waiting in the pipe,
    /// starting a fresh batch when there is none. Control and checkpoint
    /// envelopes are never coalesced into.
    pub fn push_request(&self, request: WalRequest) {
        let mut queue = self.queue.lock();
        if let Some(Envelope {
            body: MsgBody::Batch(batch),
            ..
        }) = queue.back_mut()
        {
            batch.commit.push_back(request);
        } else {
            let mut batch = Batch::default();
            batch.commit.push_back(request);
            queue.push_back(Envelope::new(MsgBody::Batch(batch), ROUTE_WRITE));
        }
        drop(queue);
        self.unparker.unpark();
    }

    /// Drains every queued envelope, FIFO.
    pub fn pop_all(&self) -> VecDeque<Envelope> {
        std::mem::take(&mut *self.queue.lock())
    }
}

/// Both pipes plus the tx-side sender. The writer thread owns the matching
/// [`Parker`]; the tx pump task owns the matching receiver.
pub struct Bus {
    pub wal_pipe: WalPipe,
    tx_pipe: mpsc::UnboundedSender<Envelope>,
}

impl Bus {
    /// Builds the bus. Returns the bus, the writer-side parker and the
    /// tx-side receiver.
    pub fn new() -> (Self, Parker, mpsc::UnboundedReceiver<Envelope>) {
        let parker = Parker::new();
        let (tx_send, tx_recv) = mpsc::unbounded_channel();
        let bus = Self {
            wal_pipe: WalPipe::new(parker.unparker().clone()),
            tx_pipe: tx_send,
        };
        (bus, parker, tx_recv)
    }

    /// Forwards an envelope to the named pipe.
    pub fn forward(&self, pipe: PipeId, envelope: Envelope) {
        match pipe {
            PipeId::Wal => self.wal_pipe.push(envelope),
            // The pump task is alive for the lifetime of the bus; a closed
            // receiver only happens during teardown, where drops are fine.
            PipeId::Tx => {
                let _ = self.tx_pipe.send(envelope);
            }
        }
    }
}
