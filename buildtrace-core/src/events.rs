//! Progress events delivered to the caller during an image build.
//!
//! Both backends are normalized into [`ProgressEvent`]. Events are handed to a
//! caller-supplied [`ProgressHandler`] one at a time, in order, from a single task.
//! The handler can abort the build by returning [`ControlFlow::Break`].
//!
//! # Example
//!
//! ```ignore
//! let (handler, mut rx) = ChannelHandler::new();
//! let builder = ImageBuilder::new(client, credentials, Config::default());
//!
//! tokio::spawn(async move {
//!     while let Some(event) = rx.recv().await {
//!         println!("{:?}", event);
//!     }
//! });
//!
//! let image = builder.build(&request, handler, CancellationToken::new()).await?;
//! ```

use crate::error::{BuildError, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::ops::ControlFlow;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Byte counts attached to a pull progress update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PullProgressDetail {
    /// Bytes completed so far (downloaded, extracted etc.)
    pub current: i64,
    /// Total bytes in this operation
    pub total: i64,
}

/// Snapshot of one sub-operation of an image pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullProgressUpdate {
    pub message: String,
    pub detail: Option<PullProgressDetail>,
    pub id: String,
}

impl PullProgressUpdate {
    pub fn new(message: &str, detail: Option<PullProgressDetail>, id: &str) -> Self {
        Self { message: message.to_string(), detail, id: id.to_string() }
    }
}

/// A single caller-visible progress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    ContextUploadProgress { step: u64, bytes_uploaded: i64 },
    StepStarting { step: u64, name: String },
    StepOutput { step: u64, output: String },
    StepPullProgress { step: u64, update: PullProgressUpdate },
    StepDownloadProgress { step: u64, downloaded: i64, total: i64 },
    StepFinished { step: u64 },
    BuildFailed { message: String },
}

impl ProgressEvent {
    /// Get the event kind string (e.g., "step_starting").
    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::ContextUploadProgress { .. } => "context_upload_progress",
            ProgressEvent::StepStarting { .. } => "step_starting",
            ProgressEvent::StepOutput { .. } => "step_output",
            ProgressEvent::StepPullProgress { .. } => "step_pull_progress",
            ProgressEvent::StepDownloadProgress { .. } => "step_download_progress",
            ProgressEvent::StepFinished { .. } => "step_finished",
            ProgressEvent::BuildFailed { .. } => "build_failed",
        }
    }

    /// Step number the event refers to, if any.
    pub fn step(&self) -> Option<u64> {
        match self {
            ProgressEvent::ContextUploadProgress { step, .. }
            | ProgressEvent::StepStarting { step, .. }
            | ProgressEvent::StepOutput { step, .. }
            | ProgressEvent::StepPullProgress { step, .. }
            | ProgressEvent::StepDownloadProgress { step, .. }
            | ProgressEvent::StepFinished { step } => Some(*step),
            ProgressEvent::BuildFailed { .. } => None,
        }
    }
}

/// Caller-supplied receiver of progress events.
///
/// Invoked synchronously, never concurrently for the same build.
/// Returning [`ControlFlow::Break`] aborts the build with [`BuildError::CallbackFailed`].
pub trait ProgressHandler: Send {
    fn on_progress(&mut self, event: &ProgressEvent) -> ControlFlow<()>;
}

impl<F> ProgressHandler for F
where
    F: FnMut(&ProgressEvent) -> ControlFlow<()> + Send,
{
    fn on_progress(&mut self, event: &ProgressEvent) -> ControlFlow<()> {
        self(event)
    }
}

/// Handler that forwards events to an async consumer.
///
/// Dropping the receiver aborts the build.
pub struct ChannelHandler {
    sender: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelHandler {
    /// Create a handler and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ProgressHandler for ChannelHandler {
    fn on_progress(&mut self, event: &ProgressEvent) -> ControlFlow<()> {
        match self.sender.send(event.clone()) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => {
                debug!("Progress receiver dropped, aborting build");
                ControlFlow::Break(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryState {
    Open,
    /// The handler returned `Break`; nothing more is delivered.
    Aborted,
    /// `BuildFailed` was delivered; step events are dropped.
    Terminated,
}

/// Delivery guard between a translator and the caller's handler.
///
/// Enforces at-most-once, in-order delivery and the event-sequence invariants:
/// nothing is delivered after an abort, no step event follows `BuildFailed`,
/// and a step cannot finish before it has started.
pub struct ProgressCallback {
    handler: Box<dyn ProgressHandler>,
    state: DeliveryState,
    started_steps: HashSet<u64>,
    delivered: u64,
}

impl ProgressCallback {
    pub fn new(handler: impl ProgressHandler + 'static) -> Self {
        Self::from_boxed(Box::new(handler))
    }

    pub fn from_boxed(handler: Box<dyn ProgressHandler>) -> Self {
        Self { handler, state: DeliveryState::Open, started_steps: HashSet::new(), delivered: 0 }
    }

    /// Number of events handed to the handler so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn is_aborted(&self) -> bool {
        self.state == DeliveryState::Aborted
    }

    pub fn is_terminated(&self) -> bool {
        self.state == DeliveryState::Terminated
    }

    /// Deliver one event to the handler.
    pub fn emit(&mut self, event: ProgressEvent) -> Result<()> {
        match self.state {
            DeliveryState::Aborted => return Err(BuildError::CallbackFailed),
            DeliveryState::Terminated => {
                debug!(kind = event.kind(), "Dropping event after build failure");
                return Ok(());
            }
            DeliveryState::Open => {}
        }

        match &event {
            ProgressEvent::StepStarting { step, .. } => {
                self.started_steps.insert(*step);
            }
            ProgressEvent::StepFinished { step } if !self.started_steps.contains(step) => {
                return Err(BuildError::contract(format!(
                    "step {} finished before it was started",
                    step
                )));
            }
            _ => {}
        }

        trace!(kind = event.kind(), step = ?event.step(), "Delivering progress event");
        metrics::counter!("buildtrace_events_total", "kind" => event.kind()).increment(1);
        self.delivered += 1;

        if self.handler.on_progress(&event).is_break() {
            warn!(delivered = self.delivered, "Progress callback requested abort");
            metrics::counter!("buildtrace_callback_aborts_total").increment(1);
            self.state = DeliveryState::Aborted;
            return Err(BuildError::CallbackFailed);
        }

        if matches!(event, ProgressEvent::BuildFailed { .. }) {
            self.state = DeliveryState::Terminated;
        }

        Ok(())
    }

    pub fn context_upload_progress(&mut self, step: u64, bytes_uploaded: i64) -> Result<()> {
        self.emit(ProgressEvent::ContextUploadProgress { step, bytes_uploaded })
    }

    pub fn step_starting(&mut self, step: u64, name: &str) -> Result<()> {
        self.emit(ProgressEvent::StepStarting { step, name: name.to_string() })
    }

    pub fn step_output(&mut self, step: u64, output: &str) -> Result<()> {
        self.emit(ProgressEvent::StepOutput { step, output: output.to_string() })
    }

    pub fn step_pull_progress(&mut self, step: u64, update: PullProgressUpdate) -> Result<()> {
        self.emit(ProgressEvent::StepPullProgress { step, update })
    }

    pub fn step_download_progress(&mut self, step: u64, downloaded: i64, total: i64) -> Result<()> {
        self.emit(ProgressEvent::StepDownloadProgress { step, downloaded, total })
    }

    pub fn step_finished(&mut self, step: u64) -> Result<()> {
        self.emit(ProgressEvent::StepFinished { step })
    }

    pub fn build_failed(&mut self, message: &str) -> Result<()> {
        self.emit(ProgressEvent::BuildFailed { message: message.to_string() })
    }
}
