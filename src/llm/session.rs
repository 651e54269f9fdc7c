//! Turn sessions: one cancellable request/response exchange
//!
//! A session owns exactly one transport stream. Deltas go to a
//! [`TurnConsumer`]; the session settles as completed, cancelled or failed,
//! and never leaves a terminal state.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::llm::transport::{CompletionDelta, CompletionRequest, CompletionTransport};
use crate::{Result, StagehandError};

/// Lifecycle state of a turn
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnState {
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TurnState::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Active => "active",
            TurnState::Completed => "completed",
            TurnState::Cancelled => "cancelled",
            TurnState::Failed => "failed",
        }
    }
}

/// Outcome of a settled turn
#[derive(Debug, Clone)]
pub enum TurnResult<T> {
    Completed(T),
    Cancelled,
    Failed(StagehandError),
}

impl<T> TurnResult<T> {
    pub fn state(&self) -> TurnState {
        match self {
            TurnResult::Completed(_) => TurnState::Completed,
            TurnResult::Cancelled => TurnState::Cancelled,
            TurnResult::Failed(_) => TurnState::Failed,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TurnResult::Completed(_))
    }
}

/// Consumes the deltas of one turn and produces its result
pub trait TurnConsumer: Send + 'static {
    type Output: Send + 'static;

    /// Handle one delta, in stream order
    fn on_delta(&mut self, delta: CompletionDelta);

    /// Build the result after the stream ended naturally
    fn finish(self) -> Result<Self::Output>;
}

/// Consumer that concatenates the text content
#[derive(Debug, Default)]
pub struct TextCollector {
    text: String,
}

impl TurnConsumer for TextCollector {
    type Output = String;

    fn on_delta(&mut self, delta: CompletionDelta) {
        if let CompletionDelta::Content(text) = delta {
            self.text.push_str(&text);
        }
    }

    fn finish(self) -> Result<String> {
        Ok(self.text)
    }
}

/// Shared state cell that only moves out of `Active` once
#[derive(Clone)]
struct StateCell(Arc<Mutex<TurnState>>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(TurnState::Active)))
    }

    fn get(&self) -> TurnState {
        *self.0.lock()
    }

    fn settle(&self, next: TurnState) -> bool {
        let mut state = self.0.lock();
        if state.is_terminal() {
            return false;
        }
        *state = next;
        true
    }
}

/// Entry point for starting turns
pub struct TurnSession;

impl TurnSession {
    /// Start a turn on the current tokio runtime
    ///
    /// `generation` and `started_at_revision` are carried for the caller's
    /// commit checks; the session itself does not interpret them.
    pub fn start<C>(
        transport: Arc<dyn CompletionTransport>,
        request: CompletionRequest,
        consumer: C,
        generation: u64,
        started_at_revision: u64,
    ) -> TurnHandle<C::Output>
    where
        C: TurnConsumer,
    {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let state = StateCell::new();
        let (result_tx, result_rx) = oneshot::channel();

        debug!(turn = %id, generation, revision = started_at_revision, "turn started");

        let task_cancel = cancel.clone();
        let task_state = state.clone();
        tokio::spawn(async move {
            let result = drive(transport, request, consumer, task_cancel).await;
            if task_state.settle(result.state()) {
                match &result {
                    TurnResult::Completed(_) => debug!(turn = %id, generation, "turn completed"),
                    TurnResult::Cancelled => debug!(turn = %id, generation, "turn cancelled"),
                    TurnResult::Failed(e) => error!(turn = %id, generation, error = %e, "turn failed"),
                }
            }
            let _ = result_tx.send(result);
        });

        TurnHandle {
            id,
            generation,
            started_at_revision,
            cancel,
            state,
            result_rx: Some(result_rx),
        }
    }
}

async fn drive<C: TurnConsumer>(
    transport: Arc<dyn CompletionTransport>,
    request: CompletionRequest,
    mut consumer: C,
    cancel: CancellationToken,
) -> TurnResult<C::Output> {
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return TurnResult::Cancelled,
        opened = transport.stream_completion(request, cancel.clone()) => opened,
    };

    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => return TurnResult::Failed(e),
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                drop(stream);
                return TurnResult::Cancelled;
            }
            next = stream.next() => match next {
                Some(Ok(delta)) => {
                    trace!(?delta, "delta");
                    consumer.on_delta(delta);
                }
                Some(Err(e)) => return TurnResult::Failed(e),
                None => break,
            },
        }
    }

    // A transport may end its stream early on cancel without an error
    if cancel.is_cancelled() {
        return TurnResult::Cancelled;
    }

    match consumer.finish() {
        Ok(output) => TurnResult::Completed(output),
        Err(e) => TurnResult::Failed(e),
    }
}

/// Handle to a running turn
pub struct TurnHandle<T> {
    id: Uuid,
    generation: u64,
    started_at_revision: u64,
    cancel: CancellationToken,
    state: StateCell,
    result_rx: Option<oneshot::Receiver<TurnResult<T>>>,
}

impl<T> TurnHandle<T> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn started_at_revision(&self) -> u64 {
        self.started_at_revision
    }

    /// Current lifecycle state
    pub fn state(&self) -> TurnState {
        self.state.get()
    }

    /// Request cancellation; the turn settles as cancelled unless it already settled
    pub fn cancel(&self) {
        self.canceller().cancel();
    }

    /// Token observed by the transport
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Detachable canceller sharing this turn's state
    pub fn canceller(&self) -> TurnCanceller {
        TurnCanceller {
            id: self.id,
            generation: self.generation,
            cancel: self.cancel.clone(),
            state: self.state.clone(),
        }
    }

    /// Wait for the turn to settle
    ///
    /// A turn cancelled through its handle always resolves to `Cancelled`,
    /// even if its stream raced to completion. Resolves only once; later
    /// calls return `Cancelled`.
    pub async fn completion(&mut self) -> TurnResult<T> {
        let Some(rx) = self.result_rx.take() else {
            return TurnResult::Cancelled;
        };

        let result = match rx.await {
            Ok(result) => result,
            Err(_) => TurnResult::Failed(StagehandError::ChannelError(
                "turn task dropped its result".to_string(),
            )),
        };

        if self.state.get() == TurnState::Cancelled {
            return TurnResult::Cancelled;
        }
        result
    }
}

/// Cancels a turn whose [`TurnHandle`] lives elsewhere
///
/// `cancel` moves the turn to `Cancelled` before returning, so the caller can
/// start the next turn knowing this one is no longer active.
#[derive(Clone)]
pub struct TurnCanceller {
    id: Uuid,
    generation: u64,
    cancel: CancellationToken,
    state: StateCell,
}

impl TurnCanceller {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> TurnState {
        self.state.get()
    }

    pub fn cancel(&self) {
        if self.state.settle(TurnState::Cancelled) {
            debug!(turn = %self.id, generation = self.generation, "turn cancel requested");
        }
        self.cancel.cancel();
    }
}

impl<T> Drop for TurnHandle<T> {
    fn drop(&mut self) {
        if !self.state.get().is_terminal() {
            self.cancel();
        }
    }
}
