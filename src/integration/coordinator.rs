//! Switch-latest pipeline coordinator
//!
//! Each pipeline slot runs one event-loop task that owns the slot's
//! [`SubmissionQueue`] and generation counter. Every trigger queues its text,
//! cancels the active turn and starts a new one over the whole queue. A
//! settled turn is applied only if its generation is still current and the
//! document is still at the revision the turn started from.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::integration::planner::{TurnCommit, TurnPlanner};
use crate::integration::queue::{SubmissionQueue, TriggerSource};
use crate::llm::session::{TurnCanceller, TurnResult, TurnSession};
use crate::llm::transport::CompletionTransport;
use crate::scene::store::DocumentStore;
use crate::{Result, StagehandError};

/// Coordinator settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { event_capacity: 64 }
    }
}

impl PipelineConfig {
    pub fn with_event_capacity(mut self, event_capacity: usize) -> Self {
        self.event_capacity = event_capacity;
        self
    }
}

/// Events published by a pipeline slot
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    /// A new turn started over the queued inputs
    TurnStarted {
        slot: &'static str,
        generation: u64,
        instruction: String,
    },

    /// A turn finished after a newer one started; its result was dropped
    TurnSuperseded { slot: &'static str, generation: u64 },

    /// A turn's document was committed
    TurnCommitted {
        slot: &'static str,
        generation: u64,
        revision: u64,
        message: String,
    },

    /// A turn completed without proposing a document
    TurnCompleted {
        slot: &'static str,
        generation: u64,
        message: String,
    },

    /// A completed turn lost the revision race
    TurnStale { slot: &'static str, generation: u64 },

    /// The active turn was cancelled
    TurnCancelled { slot: &'static str, generation: u64 },

    /// The active turn failed
    TurnFailed {
        slot: &'static str,
        generation: u64,
        error: String,
    },

    /// The slot stopped
    Shutdown { slot: &'static str },
}

impl PipelineEvent {
    /// Whether the event ends a turn
    pub fn is_settlement(&self) -> bool {
        !matches!(
            self,
            PipelineEvent::TurnStarted { .. } | PipelineEvent::Shutdown { .. }
        )
    }

    pub fn generation(&self) -> Option<u64> {
        match self {
            PipelineEvent::TurnStarted { generation, .. }
            | PipelineEvent::TurnSuperseded { generation, .. }
            | PipelineEvent::TurnCommitted { generation, .. }
            | PipelineEvent::TurnCompleted { generation, .. }
            | PipelineEvent::TurnStale { generation, .. }
            | PipelineEvent::TurnCancelled { generation, .. }
            | PipelineEvent::TurnFailed { generation, .. } => Some(*generation),
            PipelineEvent::Shutdown { .. } => None,
        }
    }
}

/// Snapshot taken when a turn starts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnTicket {
    pub generation: u64,
    /// Queue entries the turn consumes on success
    pub entry_ids: Vec<u64>,
    pub instruction: String,
    /// Document revision the turn read
    pub base_revision: u64,
}

/// How a settled turn was applied
#[derive(Debug, Clone)]
pub enum Settlement {
    Superseded,
    Committed { revision: u64, message: String },
    Completed { message: String },
    Stale,
    Cancelled,
    Failed(StagehandError),
}

impl Settlement {
    /// Whether the turn's inputs were consumed
    pub fn succeeded(&self) -> bool {
        matches!(
            self,
            Settlement::Committed { .. } | Settlement::Completed { .. }
        )
    }
}

/// Queue and generation bookkeeping for one slot
#[derive(Debug, Default)]
pub struct SlotState {
    queue: SubmissionQueue,
    generation: u64,
    active: Option<TurnTicket>,
}

impl SlotState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a submission
    pub fn enqueue(&mut self, text: impl Into<String>, source: TriggerSource) -> u64 {
        self.queue.push(text, source)
    }

    /// Start a new generation over the current queue
    ///
    /// Any previously active ticket is superseded.
    pub fn begin(&mut self, base_revision: u64) -> TurnTicket {
        self.generation += 1;
        let (entry_ids, instruction) = self.queue.snapshot();
        let ticket = TurnTicket {
            generation: self.generation,
            entry_ids,
            instruction,
            base_revision,
        };
        self.active = Some(ticket.clone());
        ticket
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .map(|ticket| ticket.generation == generation)
            .unwrap_or(false)
    }

    /// Drop the active ticket without settling it
    pub fn abandon(&mut self) -> Option<TurnTicket> {
        self.active.take()
    }

    /// Apply a turn result
    ///
    /// Results of superseded generations are dropped. A completed turn's
    /// document is written only if `store` is still at the ticket's base
    /// revision; only then, or when no document was proposed, are the
    /// ticket's queue entries removed.
    pub fn settle(
        &mut self,
        generation: u64,
        result: TurnResult<TurnCommit>,
        store: &DocumentStore,
    ) -> Settlement {
        if !self.is_current(generation) {
            return Settlement::Superseded;
        }
        let Some(ticket) = self.active.take() else {
            return Settlement::Superseded;
        };

        match result {
            TurnResult::Completed(commit) => {
                let settlement = match commit.document {
                    Some(document) => match store.set_if_revision(ticket.base_revision, document) {
                        Ok(revision) => Settlement::Committed {
                            revision,
                            message: commit.message,
                        },
                        Err(_) => return Settlement::Stale,
                    },
                    None => Settlement::Completed {
                        message: commit.message,
                    },
                };
                self.queue.remove_ids(&ticket.entry_ids);
                settlement
            }
            TurnResult::Cancelled => Settlement::Cancelled,
            TurnResult::Failed(e) => Settlement::Failed(e),
        }
    }

    pub fn queue(&self) -> &SubmissionQueue {
        &self.queue
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn active(&self) -> Option<&TurnTicket> {
        self.active.as_ref()
    }
}

/// Read-only view of a slot for observers
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlotStatus {
    pub queued: Vec<String>,
    pub generation: u64,
    pub active: bool,
    pub last_message: Option<String>,
    pub last_error: Option<String>,
}

enum SlotMessage {
    Trigger { text: String, source: TriggerSource },
    Settled {
        generation: u64,
        result: TurnResult<TurnCommit>,
    },
    Cancel,
    Shutdown,
}

/// Event loop for one pipeline slot
pub struct PipelineCoordinator<P: TurnPlanner> {
    planner: P,
    transport: Arc<dyn CompletionTransport>,
    store: DocumentStore,
    state: SlotState,
    active_turn: Option<TurnCanceller>,
    rx: mpsc::UnboundedReceiver<SlotMessage>,
    self_tx: mpsc::WeakUnboundedSender<SlotMessage>,
    event_tx: broadcast::Sender<PipelineEvent>,
    status: Arc<RwLock<SlotStatus>>,
}

impl<P: TurnPlanner> PipelineCoordinator<P> {
    /// Spawn the slot's event loop on the current runtime
    ///
    /// The loop runs until [`PipelineHandle::shutdown`] is called or every
    /// handle and trigger sender has been dropped.
    pub fn spawn(
        planner: P,
        transport: Arc<dyn CompletionTransport>,
        store: DocumentStore,
        config: &PipelineConfig,
    ) -> PipelineHandle {
        let (coordinator, handle) = Self::new(planner, transport, store, config);
        let task = tokio::spawn(coordinator.run());
        *handle.task.lock() = Some(task);
        handle
    }

    fn new(
        planner: P,
        transport: Arc<dyn CompletionTransport>,
        store: DocumentStore,
        config: &PipelineConfig,
    ) -> (Self, PipelineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let status = Arc::new(RwLock::new(SlotStatus::default()));
        let slot = planner.slot();

        let coordinator = Self {
            planner,
            transport,
            store,
            state: SlotState::new(),
            active_turn: None,
            rx,
            self_tx: tx.downgrade(),
            event_tx: event_tx.clone(),
            status: Arc::clone(&status),
        };
        let handle = PipelineHandle {
            slot,
            tx,
            event_tx,
            status,
            task: Arc::new(parking_lot::Mutex::new(None)),
        };
        (coordinator, handle)
    }

    async fn run(mut self) {
        let slot = self.planner.slot();
        info!(slot, "pipeline started");

        while let Some(message) = self.rx.recv().await {
            match message {
                SlotMessage::Trigger { text, source } => self.on_trigger(text, source),
                SlotMessage::Settled { generation, result } => self.on_settled(generation, result),
                SlotMessage::Cancel => self.on_cancel(),
                SlotMessage::Shutdown => break,
            }
        }

        self.cancel_active();
        let _ = self.event_tx.send(PipelineEvent::Shutdown { slot });
        info!(slot, "pipeline stopped");
    }

    fn on_trigger(&mut self, text: String, source: TriggerSource) {
        let slot = self.planner.slot();
        self.state.enqueue(text, source);

        // Switch-latest: the previous turn is Cancelled before the new one starts
        self.cancel_active();

        let snapshot = self.store.current();
        let ticket = self.state.begin(snapshot.revision);
        debug!(
            slot,
            generation = ticket.generation,
            revision = ticket.base_revision,
            queued = ticket.entry_ids.len(),
            source = source.as_str(),
            "starting turn"
        );

        let (request, consumer) = self.planner.plan(&ticket.instruction, &snapshot);
        let mut turn = TurnSession::start(
            Arc::clone(&self.transport),
            request,
            consumer,
            ticket.generation,
            ticket.base_revision,
        );
        self.active_turn = Some(turn.canceller());

        let generation = ticket.generation;
        let notify = self.self_tx.clone();
        tokio::spawn(async move {
            let result = turn.completion().await;
            if let Some(tx) = notify.upgrade() {
                let _ = tx.send(SlotMessage::Settled { generation, result });
            }
        });

        let _ = self.event_tx.send(PipelineEvent::TurnStarted {
            slot,
            generation,
            instruction: ticket.instruction,
        });
        self.publish_status(None, None);
    }

    fn on_settled(&mut self, generation: u64, result: TurnResult<TurnCommit>) {
        let slot = self.planner.slot();
        let settlement = self.state.settle(generation, result, &self.store);
        if !matches!(settlement, Settlement::Superseded) {
            self.active_turn = None;
        }

        let event = match settlement {
            Settlement::Superseded => {
                debug!(slot, generation, "dropping result of superseded turn");
                PipelineEvent::TurnSuperseded { slot, generation }
            }
            Settlement::Committed { revision, message } => {
                info!(slot, generation, revision, "turn committed");
                self.publish_status(Some(message.clone()), None);
                PipelineEvent::TurnCommitted {
                    slot,
                    generation,
                    revision,
                    message,
                }
            }
            Settlement::Completed { message } => {
                info!(slot, generation, "turn completed without a document");
                self.publish_status(Some(message.clone()), None);
                PipelineEvent::TurnCompleted {
                    slot,
                    generation,
                    message,
                }
            }
            Settlement::Stale => {
                warn!(slot, generation, "document changed during the turn, result dropped");
                self.publish_status(None, None);
                PipelineEvent::TurnStale { slot, generation }
            }
            Settlement::Cancelled => {
                debug!(slot, generation, "turn cancelled");
                self.publish_status(None, None);
                PipelineEvent::TurnCancelled { slot, generation }
            }
            Settlement::Failed(e) => {
                error!(slot, generation, error = %e, "turn failed, queued inputs kept");
                self.publish_status(None, Some(e.to_string()));
                PipelineEvent::TurnFailed {
                    slot,
                    generation,
                    error: e.to_string(),
                }
            }
        };
        let _ = self.event_tx.send(event);
    }

    fn cancel_active(&mut self) {
        if let Some(turn) = self.active_turn.take() {
            debug!(slot = self.planner.slot(), generation = turn.generation(), "cancelling active turn");
            turn.cancel();
        }
    }

    /// Explicit stop: the ticket is dropped here, so a result already on its
    /// way back settles as superseded and never commits
    fn on_cancel(&mut self) {
        self.cancel_active();
        let Some(ticket) = self.state.abandon() else {
            return;
        };

        let slot = self.planner.slot();
        debug!(slot, generation = ticket.generation, "turn stopped, queued inputs kept");
        self.publish_status(None, None);
        let _ = self.event_tx.send(PipelineEvent::TurnCancelled {
            slot,
            generation: ticket.generation,
        });
    }

    fn publish_status(&self, message: Option<String>, error: Option<String>) {
        let mut status = self.status.write();
        status.queued = self.state.queue().texts();
        status.generation = self.state.generation();
        status.active = self.state.active().is_some();
        if message.is_some() {
            status.last_message = message;
        }
        if error.is_some() {
            status.last_error = error;
        }
    }
}

/// Control handle for a pipeline slot
#[derive(Clone)]
pub struct PipelineHandle {
    slot: &'static str,
    tx: mpsc::UnboundedSender<SlotMessage>,
    event_tx: broadcast::Sender<PipelineEvent>,
    status: Arc<RwLock<SlotStatus>>,
    task: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl PipelineHandle {
    pub fn slot(&self) -> &'static str {
        self.slot
    }

    /// Submit a trigger
    ///
    /// Blank text is dropped unless it comes from a button. Returns whether
    /// the trigger was accepted.
    pub fn submit(&self, text: impl Into<String>, source: TriggerSource) -> Result<bool> {
        let text = text.into();
        if text.trim().is_empty() && source != TriggerSource::Button {
            debug!(slot = self.slot, source = source.as_str(), "dropping empty submission");
            return Ok(false);
        }

        self.tx
            .send(SlotMessage::Trigger { text, source })
            .map_err(|_| StagehandError::ChannelError(format!("{} pipeline stopped", self.slot)))?;
        Ok(true)
    }

    /// Sender bound to one trigger source
    pub fn trigger_sender(&self, source: TriggerSource) -> TriggerSender {
        TriggerSender {
            handle: self.clone(),
            source,
        }
    }

    /// Cancel the active turn without starting another; the queue is kept
    pub fn cancel(&self) -> Result<()> {
        self.tx
            .send(SlotMessage::Cancel)
            .map_err(|_| StagehandError::ChannelError(format!("{} pipeline stopped", self.slot)))
    }

    /// Subscribe to pipeline events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.event_tx.subscribe()
    }

    pub fn status(&self) -> SlotStatus {
        self.status.read().clone()
    }

    /// Stop the slot and wait for its event loop to exit
    pub async fn shutdown(&self) {
        let _ = self.tx.send(SlotMessage::Shutdown);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(slot = self.slot, error = %e, "pipeline task ended abnormally");
            }
        }
    }
}

/// Trigger source feeding a pipeline slot
#[derive(Clone)]
pub struct TriggerSender {
    handle: PipelineHandle,
    source: TriggerSource,
}

impl TriggerSender {
    pub fn source(&self) -> TriggerSource {
        self.source
    }

    /// Submit one trigger; blank text is dropped
    pub fn send(&self, text: impl Into<String>) -> Result<bool> {
        self.handle.submit(text, self.source)
    }

    /// Forward every item of `stream` as a trigger
    ///
    /// Several forwarded sources merge into the slot in arrival order.
    pub fn forward_from<S>(self, stream: S) -> JoinHandle<()>
    where
        S: Stream<Item = String> + Send + 'static,
    {
        tokio::spawn(async move {
            futures::pin_mut!(stream);
            while let Some(text) = stream.next().await {
                if self.send(text).is_err() {
                    break;
                }
            }
        })
    }
}
