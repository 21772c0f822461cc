//! The per-build event translator.
//!
//! Exactly one translator runs per build, selected by builder version. It is
//! owned by a single task ([`EventPump`]) that receives already-decoded backend
//! messages over a channel, so the step tables are never shared.

use crate::error::{BuildError, Result};
use crate::events::ProgressCallback;
use crate::graph::SolveStatus;
use crate::legacy::{BuildResultPayload, JsonMessage, LegacyStreamParser};
use crate::output::OutputSink;
use crate::request::BuilderVersion;
use crate::stream::{IMAGE_ID_MESSAGE, TRACE_MESSAGE};
use crate::tracer::VertexTracer;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Input to the translator task.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    /// A message from the daemon's build response stream
    Json(JsonMessage),
    /// A solve status batch reported outside the response stream (session side channel)
    Status(SolveStatus),
    /// Total bytes of build context uploaded so far
    ContextUpload(i64),
}

/// Producer handle for the translator channel.
#[derive(Debug, Clone)]
pub struct BackendSender {
    tx: mpsc::Sender<BackendMessage>,
}

impl BackendSender {
    pub fn new(tx: mpsc::Sender<BackendMessage>) -> Self {
        Self { tx }
    }

    /// Queue a message. Returns false once the translator has stopped.
    pub async fn send(&self, msg: BackendMessage) -> bool {
        self.tx.send(msg).await.is_ok()
    }

    pub async fn context_upload(&self, bytes_uploaded: i64) -> bool {
        self.send(BackendMessage::ContextUpload(bytes_uploaded)).await
    }

    pub async fn status(&self, status: SolveStatus) -> bool {
        self.send(BackendMessage::Status(status)).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// BuildKit translation state: the vertex tracer plus the reported image id.
#[derive(Debug, Default)]
pub struct GraphTranslator {
    tracer: VertexTracer,
    image_id: Option<String>,
}

impl GraphTranslator {
    fn on_message(
        &mut self,
        msg: &JsonMessage,
        callback: &mut ProgressCallback,
        mut output: Option<&mut OutputSink>,
    ) -> Result<()> {
        match msg.id.as_str() {
            IMAGE_ID_MESSAGE => {
                let aux = msg
                    .aux
                    .clone()
                    .ok_or_else(|| BuildError::protocol("image id message without payload"))?;
                let result: BuildResultPayload = serde_json::from_value(aux)?;
                debug!(image_id = %result.id, "Received build result");
                self.image_id = Some(result.id);
            }
            TRACE_MESSAGE => {
                let aux = msg
                    .aux
                    .as_ref()
                    .ok_or_else(|| BuildError::protocol("trace message without payload"))?;
                let status = SolveStatus::from_trace_aux(aux)?;
                self.on_status(&status, callback, output.as_deref_mut())?;
            }
            _ => {
                if let Some(output) = output.as_deref_mut() {
                    output.render_message(msg);
                }
            }
        }

        if let Some(message) = msg.failure() {
            if matches!(msg.id.as_str(), IMAGE_ID_MESSAGE | TRACE_MESSAGE) {
                if let Some(output) = output.as_deref_mut() {
                    output.render_message(msg);
                }
            }
            return self.tracer.on_build_failed(message, callback);
        }

        Ok(())
    }

    fn on_status(
        &mut self,
        status: &SolveStatus,
        callback: &mut ProgressCallback,
        output: Option<&mut OutputSink>,
    ) -> Result<()> {
        let outcome = self.tracer.on_status(status, callback);

        if let Some(output) = output {
            let tracer = &self.tracer;
            output.render_status(status, |digest| tracer.step_number(digest).ok());
        }

        outcome
    }
}

/// The two backend-specific translators.
#[derive(Debug)]
pub enum Translator {
    Legacy(LegacyStreamParser),
    Graph(GraphTranslator),
}

impl Translator {
    pub fn for_builder(builder: BuilderVersion) -> Self {
        match builder {
            BuilderVersion::Legacy => Translator::Legacy(LegacyStreamParser::new()),
            BuilderVersion::BuildKit => Translator::Graph(GraphTranslator::default()),
        }
    }

    /// Translate one backend message into zero or more events.
    pub fn handle(
        &mut self,
        msg: &BackendMessage,
        callback: &mut ProgressCallback,
        output: Option<&mut OutputSink>,
    ) -> Result<()> {
        match (self, msg) {
            (Translator::Legacy(parser), BackendMessage::Json(msg)) => {
                if let Some(output) = output {
                    output.render_message(msg);
                }
                parser.on_message(msg, callback)
            }
            (Translator::Legacy(parser), BackendMessage::ContextUpload(bytes)) => {
                parser.on_context_upload(*bytes, callback)
            }
            (Translator::Graph(graph), BackendMessage::Json(msg)) => {
                graph.on_message(msg, callback, output)
            }
            (Translator::Graph(graph), BackendMessage::Status(status)) => {
                graph.on_status(status, callback, output)
            }
            (Translator::Legacy(_), BackendMessage::Status(_)) => {
                Err(BuildError::contract("solve status sent to the legacy translator"))
            }
            (Translator::Graph(_), BackendMessage::ContextUpload(_)) => {
                Err(BuildError::contract("context upload progress sent to the graph translator"))
            }
        }
    }

    /// Finish at end of input, returning the built image id.
    pub fn finish(&mut self, callback: &mut ProgressCallback) -> Result<String> {
        let image_id = match self {
            Translator::Legacy(parser) => parser.finish(callback)?,
            Translator::Graph(graph) => graph.image_id.take(),
        };

        image_id.ok_or_else(|| BuildError::protocol("build finished without reporting an image id"))
    }
}

/// Task body owning the translator and the caller's callback.
pub struct EventPump {
    translator: Translator,
    callback: ProgressCallback,
    output: Option<OutputSink>,
}

impl EventPump {
    pub fn new(translator: Translator, callback: ProgressCallback) -> Self {
        Self { translator, callback, output: None }
    }

    pub fn with_output(mut self, output: Option<OutputSink>) -> Self {
        self.output = output;
        self
    }

    /// Translate messages until every sender is dropped, a message fails, or
    /// `cancel` fires. Returns the image id on success.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<BackendMessage>,
        cancel: CancellationToken,
    ) -> Result<String> {
        let outcome = self.pump(&mut rx, &cancel).await;

        // Producers notice the closed channel and stop reading the backend.
        rx.close();

        match &outcome {
            Ok(image_id) => debug!(
                image_id = %image_id,
                delivered = self.callback.delivered(),
                "Translator finished"
            ),
            Err(BuildError::Cancelled) => debug!("Translator cancelled"),
            Err(e) => warn!(delivered = self.callback.delivered(), "Translator stopped: {}", e),
        }

        outcome
    }

    async fn pump(
        &mut self,
        rx: &mut mpsc::Receiver<BackendMessage>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BuildError::Cancelled),
                msg = rx.recv() => msg,
            };

            let Some(msg) = msg else { break };
            self.translator.handle(&msg, &mut self.callback, self.output.as_mut())?;
        }

        self.translator.finish(&mut self.callback)
    }
}
