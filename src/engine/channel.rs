//! Bounded hand-off between capture sources and save workers.
//!
//! All cross-task synchronization of the pipeline lives here: backpressure on
//! enqueue, FIFO dequeue by any idle worker, per-camera write sequencing, the
//! acknowledgement ledger behind the join barrier, and forced abort.

use crate::core::{CameraId, Frame};
use crate::error::{FrameFailure, PipelineError};
use crossbeam_channel::{Receiver, Select, Sender};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

/// Final fate of a frame that entered the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Saved,
    UnknownCamera,
    WriteFailure,
    Abandoned,
}

impl From<&FrameFailure> for Outcome {
    fn from(failure: &FrameFailure) -> Self {
        match failure {
            FrameFailure::UnknownCamera(_) => Outcome::UnknownCamera,
            FrameFailure::WriteFailure { .. } => Outcome::WriteFailure,
            FrameFailure::Abandoned => Outcome::Abandoned,
        }
    }
}

/// Acknowledgement counters for one camera
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraLedger {
    pub enqueued: u64,
    pub saved: u64,
    pub unknown_camera: u64,
    pub write_failures: u64,
    pub abandoned: u64,
}

impl CameraLedger {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Saved => self.saved += 1,
            Outcome::UnknownCamera => self.unknown_camera += 1,
            Outcome::WriteFailure => self.write_failures += 1,
            Outcome::Abandoned => self.abandoned += 1,
        }
    }

    /// Frames acknowledged as anything but saved
    pub fn lost(&self) -> u64 {
        self.unknown_camera + self.write_failures + self.abandoned
    }

    pub fn acknowledged(&self) -> u64 {
        self.saved + self.lost()
    }

    /// Enqueued but not yet acknowledged
    pub fn pending(&self) -> u64 {
        self.enqueued - self.acknowledged()
    }

    fn merge(&mut self, other: &CameraLedger) {
        self.enqueued += other.enqueued;
        self.saved += other.saved;
        self.unknown_camera += other.unknown_camera;
        self.write_failures += other.write_failures;
        self.abandoned += other.abandoned;
    }
}

/// Consistent snapshot of the channel's accounting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    cameras: BTreeMap<CameraId, CameraLedger>,
}

impl Ledger {
    pub fn camera(&self, camera: &CameraId) -> Option<&CameraLedger> {
        self.cameras.get(camera)
    }

    pub fn cameras(&self) -> impl Iterator<Item = (&CameraId, &CameraLedger)> {
        self.cameras.iter()
    }

    pub fn totals(&self) -> CameraLedger {
        let mut totals = CameraLedger::default();
        for ledger in self.cameras.values() {
            totals.merge(ledger);
        }
        totals
    }

    pub fn pending(&self) -> u64 {
        self.cameras.values().map(CameraLedger::pending).sum()
    }
}

/// Per-camera ticket bookkeeping used to serialize writes in capture order
#[derive(Debug, Default)]
struct Sequencer {
    issued: u64,
    /// Lowest ticket not yet acknowledged
    next: u64,
    done_ahead: BTreeSet<u64>,
}

impl Sequencer {
    fn issue(&mut self) -> u64 {
        let ticket = self.issued;
        self.issued += 1;
        ticket
    }

    fn complete(&mut self, ticket: u64) {
        if ticket == self.next {
            self.next += 1;
            while self.done_ahead.remove(&self.next) {
                self.next += 1;
            }
        } else if ticket > self.next {
            self.done_ahead.insert(ticket);
        }
    }
}

#[derive(Debug, Default)]
struct State {
    ledger: Ledger,
    sequencers: HashMap<CameraId, Sequencer>,
    aborted: bool,
}

struct Shared {
    state: Mutex<State>,
    turn_changed: Condvar,
    pending_tx: watch::Sender<u64>,
    preserve_order: bool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn admit(&self, camera: &CameraId) -> u64 {
        let mut state = self.lock();
        state.ledger.cameras.entry(camera.clone()).or_default().enqueued += 1;
        let ticket = state.sequencers.entry(camera.clone()).or_default().issue();
        self.pending_tx.send_replace(state.ledger.pending());
        ticket
    }

    fn settle(&self, camera: &CameraId, ticket: u64, outcome: Outcome) {
        let mut state = self.lock();
        state.ledger.cameras.entry(camera.clone()).or_default().record(outcome);
        if let Some(sequencer) = state.sequencers.get_mut(camera) {
            sequencer.complete(ticket);
        }
        self.pending_tx.send_replace(state.ledger.pending());
        drop(state);
        self.turn_changed.notify_all();
    }

    fn wait_turn(&self, camera: &CameraId, ticket: u64) -> bool {
        let mut state = self.lock();
        loop {
            if state.aborted {
                return false;
            }
            if !self.preserve_order {
                return true;
            }
            let next = state.sequencers.get(camera).map_or(ticket, |s| s.next);
            if next >= ticket {
                return true;
            }
            state = self
                .turn_changed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

struct Envelope {
    frame: Frame,
    ticket: u64,
}

/// Why a frame could not be enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRejected {
    /// The channel was aborted; the frame was counted as abandoned
    Aborted,
    /// Every receiver is gone; the frame was counted as abandoned
    Disconnected,
}

/// Owner of the channel; held by the pipeline coordinator
pub struct FrameChannel {
    shared: Arc<Shared>,
    tx: Option<Sender<Envelope>>,
    rx: Receiver<Envelope>,
    abort_tx: Mutex<Option<Sender<()>>>,
    abort_rx: Receiver<()>,
    capacity: usize,
}

impl FrameChannel {
    /// `capacity` 0 makes every enqueue a direct hand-off to a waiting worker
    pub fn new(capacity: usize, preserve_order: bool) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let (abort_tx, abort_rx) = crossbeam_channel::bounded(0);
        let (pending_tx, _) = watch::channel(0);

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                turn_changed: Condvar::new(),
                pending_tx,
                preserve_order,
            }),
            tx: Some(tx),
            rx,
            abort_tx: Mutex::new(Some(abort_tx)),
            abort_rx,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Producer handle; `None` once the channel has been closed
    pub fn sender(&self) -> Option<FrameSender> {
        self.tx.as_ref().map(|tx| FrameSender {
            tx: tx.clone(),
            abort_rx: self.abort_rx.clone(),
            shared: self.shared.clone(),
        })
    }

    pub fn receiver(&self) -> FrameReceiver {
        FrameReceiver {
            rx: self.rx.clone(),
            abort_rx: self.abort_rx.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Drop the coordinator's own producer handle.
    ///
    /// Workers see the channel as closed once every sender is gone and the
    /// queue is empty.
    pub fn close(&mut self) {
        self.tx = None;
    }

    /// Frames currently sitting in the queue
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Enqueued frames not yet acknowledged by a worker
    pub fn pending(&self) -> u64 {
        self.shared.lock().ledger.pending()
    }

    pub fn snapshot(&self) -> Ledger {
        self.shared.lock().ledger.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.lock().aborted
    }

    /// Wait until every frame enqueued so far has been acknowledged.
    ///
    /// Does not stop new enqueues; producers must be stopped first for the
    /// barrier to mean "everything is drained".
    pub async fn join(&self) {
        let mut pending = self.shared.pending_tx.subscribe();
        // The sender lives in `shared`, so this only returns once pending hits zero
        let _ = pending.wait_for(|count| *count == 0).await;
    }

    pub async fn join_timeout(&self, timeout: Option<Duration>) -> Result<(), PipelineError> {
        let Some(limit) = timeout else {
            self.join().await;
            return Ok(());
        };
        tokio::time::timeout(limit, self.join())
            .await
            .map_err(|_| PipelineError::DrainTimeout {
                waited: limit,
                unacknowledged: self.pending(),
            })
    }

    /// Forced teardown: release blocked producers, stop workers from writing,
    /// and count everything still queued as abandoned.
    ///
    /// Returns the number of queued frames discarded by this call.
    pub fn abort(&self) -> u64 {
        {
            let mut state = self.shared.lock();
            state.aborted = true;
        }
        self.shared.turn_changed.notify_all();

        let mut abort_tx = self
            .abort_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        abort_tx.take();
        drop(abort_tx);

        self.discard_queued()
    }

    /// Acknowledge every queued frame as abandoned
    pub fn discard_queued(&self) -> u64 {
        let mut discarded = 0;
        while let Ok(envelope) = self.rx.try_recv() {
            let camera = envelope.frame.camera_id().clone();
            self.shared.settle(&camera, envelope.ticket, Outcome::Abandoned);
            discarded += 1;
        }
        discarded
    }
}

/// Producer side, one clone per capture source
#[derive(Clone)]
pub struct FrameSender {
    tx: Sender<Envelope>,
    abort_rx: Receiver<()>,
    shared: Arc<Shared>,
}

impl FrameSender {
    /// Enqueue a frame, blocking while the channel is full.
    ///
    /// The frame counts as enqueued from the moment this is called, so a
    /// concurrent join barrier also waits for frames still blocked here.
    pub fn send(&self, frame: Frame) -> Result<(), SendRejected> {
        let camera = frame.camera_id().clone();
        let ticket = self.shared.admit(&camera);
        let envelope = Envelope { frame, ticket };

        if self.shared.lock().aborted {
            self.shared.settle(&camera, ticket, Outcome::Abandoned);
            return Err(SendRejected::Aborted);
        }

        let mut select = Select::new();
        let send_index = select.send(&self.tx);
        let abort_index = select.recv(&self.abort_rx);
        let operation = select.select();

        if operation.index() == send_index {
            operation.send(&self.tx, envelope).map_err(|_| {
                self.shared.settle(&camera, ticket, Outcome::Abandoned);
                SendRejected::Disconnected
            })
        } else {
            debug_assert_eq!(operation.index(), abort_index);
            let _ = operation.recv(&self.abort_rx);
            self.shared.settle(&camera, ticket, Outcome::Abandoned);
            Err(SendRejected::Aborted)
        }
    }
}

/// Consumer side, one clone per save worker
#[derive(Clone)]
pub struct FrameReceiver {
    rx: Receiver<Envelope>,
    abort_rx: Receiver<()>,
    shared: Arc<Shared>,
}

impl FrameReceiver {
    /// Block until a frame is available.
    ///
    /// Returns `None` once the channel is closed and empty, or aborted.
    pub fn recv(&self) -> Option<Delivery> {
        let mut select = Select::new();
        let frame_index = select.recv(&self.rx);
        let abort_index = select.recv(&self.abort_rx);
        let operation = select.select();

        if operation.index() == frame_index {
            let envelope = operation.recv(&self.rx).ok()?;
            Some(Delivery {
                frame: envelope.frame,
                ticket: envelope.ticket,
                shared: self.shared.clone(),
                settled: false,
            })
        } else {
            debug_assert_eq!(operation.index(), abort_index);
            let _ = operation.recv(&self.abort_rx);
            None
        }
    }
}

/// A dequeued frame awaiting acknowledgement.
///
/// Dropping a delivery without calling [`Delivery::ack`] acknowledges the
/// frame as abandoned, so the join barrier can never wait on a frame that
/// already left the queue.
pub struct Delivery {
    frame: Frame,
    ticket: u64,
    shared: Arc<Shared>,
    settled: bool,
}

impl Delivery {
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Block until every earlier frame of the same camera has been
    /// acknowledged. Returns `false` if the channel was aborted meanwhile.
    pub fn wait_turn(&self) -> bool {
        self.shared.wait_turn(self.frame.camera_id(), self.ticket)
    }

    /// Record the frame's outcome and release its buffer
    pub fn ack(mut self, outcome: Outcome) {
        self.settled = true;
        self.shared
            .settle(self.frame.camera_id(), self.ticket, outcome);
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.settled {
            self.shared
                .settle(self.frame.camera_id(), self.ticket, Outcome::Abandoned);
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("camera", self.frame.camera_id())
            .field("frame_id", &self.frame.frame_id())
            .field("ticket", &self.ticket)
            .finish()
    }
}
