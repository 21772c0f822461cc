//! Build orchestration.
//!
//! One build runs as a small group of tasks sharing a cancellation token:
//!
//! - the submitter sends the build request and forwards the response stream,
//! - the translator ([`EventPump`]) turns backend messages into events,
//! - for BuildKit, the session server and a cancel watcher.
//!
//! The first task to fail cancels the others; the group is always drained
//! before the outcome is reported.

use crate::client::{node_identifier, DaemonClient, ImageBuildOptions, Session};
use crate::config::Config;
use crate::credentials::CredentialProvider;
use crate::error::{BuildError, Result};
use crate::events::{ProgressCallback, ProgressHandler};
use crate::observability::metrics::record_build;
use crate::output::OutputSink;
use crate::paths;
use crate::request::{BuilderVersion, ImageBuildRequest};
use crate::stream::forward_messages;
use crate::translator::{BackendSender, EventPump, Translator};
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Fail-fast group of build tasks.
struct TaskGroup {
    tasks: JoinSet<Result<()>>,
    token: CancellationToken,
}

impl TaskGroup {
    /// Tasks observe a child of `parent`, so caller cancellation reaches all of them.
    fn new(parent: &CancellationToken) -> Self {
        Self { tasks: JoinSet::new(), token: parent.child_token() }
    }

    fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        debug!(task = name, "Starting build task");
        self.tasks.spawn(async move {
            let outcome = task.await;
            if let Err(e) = &outcome {
                debug!(task = name, "Build task failed: {}", e);
            }
            outcome
        });
    }

    /// Wait for every task. The first failure cancels the rest.
    ///
    /// A callback abort outranks every other error; otherwise the first error wins.
    /// A panicking task resumes its panic here.
    async fn wait(mut self) -> Vec<BuildError> {
        let mut errors = Vec::new();

        while let Some(joined) = self.tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => Err(BuildError::Other(anyhow::anyhow!("build task aborted: {}", e))),
            };

            if let Err(e) = outcome {
                if errors.is_empty() {
                    self.token.cancel();
                }
                errors.push(e);
            }
        }

        errors
    }
}

/// Pick the terminal error of a failed build.
fn reconcile(errors: Vec<BuildError>, caller_cancelled: bool) -> Option<BuildError> {
    if errors.iter().any(|e| matches!(e, BuildError::CallbackFailed)) {
        return Some(BuildError::CallbackFailed);
    }

    if caller_cancelled {
        return Some(BuildError::Cancelled);
    }

    errors.into_iter().next()
}

/// Run `task` until `token` fires.
async fn until_cancelled<F>(token: CancellationToken, task: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        _ = token.cancelled() => Err(BuildError::Cancelled),
        outcome = task => outcome,
    }
}

/// Builds images through a daemon, reporting progress as step events.
pub struct ImageBuilder {
    client: Arc<dyn DaemonClient>,
    credentials: Arc<dyn CredentialProvider>,
    config: Config,
    config_dir: PathBuf,
}

impl ImageBuilder {
    pub fn new(
        client: Arc<dyn DaemonClient>,
        credentials: Arc<dyn CredentialProvider>,
        config: Config,
    ) -> Self {
        Self { client, credentials, config, config_dir: paths::config_dir() }
    }

    /// Use a different directory for the build node id.
    pub fn with_config_dir(mut self, config_dir: impl Into<PathBuf>) -> Self {
        self.config_dir = config_dir.into();
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Output sink writing to `writer`, coloured if the configuration enables it.
    pub fn output_to(&self, writer: impl Write + Send + 'static) -> OutputSink {
        OutputSink::new(writer, self.config.color_output)
    }

    /// Build an image, returning its id.
    ///
    /// Events are delivered to `handler` in order from a single task. Cancelling
    /// `cancel` stops event delivery, asks the daemon to cancel the build and
    /// fails with [`BuildError::Cancelled`].
    pub async fn build(
        &self,
        request: &ImageBuildRequest,
        handler: impl ProgressHandler + 'static,
        cancel: CancellationToken,
    ) -> Result<String> {
        self.build_with_output(request, handler, None, cancel).await
    }

    /// Like [`ImageBuilder::build`], also rendering progress to standard output.
    pub async fn build_to_stdout(
        &self,
        request: &ImageBuildRequest,
        handler: impl ProgressHandler + 'static,
        cancel: CancellationToken,
    ) -> Result<String> {
        let output = OutputSink::stdout(self.config.color_output);
        self.build_with_output(request, handler, Some(output), cancel).await
    }

    /// Like [`ImageBuilder::build`], also rendering progress to `output`.
    #[instrument(skip_all, fields(context = %request.context_directory.display()))]
    pub async fn build_with_output(
        &self,
        request: &ImageBuildRequest,
        handler: impl ProgressHandler + 'static,
        output: Option<OutputSink>,
        cancel: CancellationToken,
    ) -> Result<String> {
        let builder = request.builder.unwrap_or(self.config.builder);
        let start = Instant::now();
        info!(builder = %builder, tags = ?request.image_tags, "Starting image build");

        let pump = EventPump::new(Translator::for_builder(builder), ProgressCallback::new(handler))
            .with_output(output);

        let outcome = match builder {
            BuilderVersion::Legacy => self.run_legacy(request, pump, &cancel).await,
            BuilderVersion::BuildKit => self.run_buildkit(request, pump, &cancel).await,
        };

        let duration = start.elapsed().as_secs_f64();
        match &outcome {
            Ok(image_id) => {
                info!(image_id = %image_id, duration_secs = duration, "Image build succeeded");
                record_build(builder.label(), "success", duration);
            }
            Err(e) => {
                warn!(
                    kind = e.kind().as_str(),
                    duration_secs = duration,
                    "Image build failed: {}",
                    e
                );
                record_build(builder.label(), e.kind().as_str(), duration);
            }
        }

        outcome
    }

    async fn run_legacy(
        &self,
        request: &ImageBuildRequest,
        pump: EventPump,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let options =
            ImageBuildOptions::legacy(request, self.credentials.as_ref(), &self.client.host());

        let mut group = TaskGroup::new(cancel);
        let (sender, image_id) = self.spawn_pump(&mut group, pump);

        // The daemon stops a legacy build when its response stream is dropped.
        let client = self.client.clone();
        let upload = self.config.report_context_upload_progress.then(|| sender.clone());
        group.spawn(
            "submit",
            until_cancelled(group.token(), async move {
                let body = client.image_build(&options, upload).await?;
                forward_messages(body, &sender).await
            }),
        );

        self.finish(group, image_id, cancel).await
    }

    async fn run_buildkit(
        &self,
        request: &ImageBuildRequest,
        pump: EventPump,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let session = Session::new(request, &node_identifier(&self.config_dir));
        let options = ImageBuildOptions::buildkit(
            request,
            &session,
            self.credentials.as_ref(),
            &self.client.host(),
        );
        let build_id = options
            .build_id
            .clone()
            .ok_or_else(|| BuildError::contract("BuildKit options without a build id"))?;
        debug!(session_id = %session.id, build_id = %build_id, "Created build session");

        let mut group = TaskGroup::new(cancel);
        let (sender, image_id) = self.spawn_pump(&mut group, pump);

        // Ends the session once the response stream is done, and tells the
        // cancel watcher the build no longer needs cancelling.
        let session_token = group.token().child_token();
        let build_done = CancellationToken::new();

        let client = self.client.clone();
        let statuses = sender.clone();
        let token = session_token.clone();
        group.spawn("session", async move { client.run_session(&session, statuses, token).await });

        let client = self.client.clone();
        let done = build_done.clone();
        group.spawn(
            "submit",
            until_cancelled(group.token(), async move {
                let _session = session_token.drop_guard();
                let _done = done.drop_guard();
                let body = client.image_build(&options, None).await?;
                forward_messages(body, &sender).await
            }),
        );

        let client = self.client.clone();
        let group_token = group.token();
        let cancel_timeout = self.config.cancel_timeout();
        group.spawn("cancel-watcher", async move {
            tokio::select! {
                biased;
                _ = group_token.cancelled() => {
                    cancel_remote_build(client.as_ref(), &build_id, cancel_timeout).await;
                }
                _ = build_done.cancelled() => {}
            }
            Ok(())
        });

        self.finish(group, image_id, cancel).await
    }

    /// Spawn the translator and return the producer handle plus its result slot.
    fn spawn_pump(
        &self,
        group: &mut TaskGroup,
        pump: EventPump,
    ) -> (BackendSender, oneshot::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.config.event_buffer_size.max(1));
        let (id_tx, id_rx) = oneshot::channel();

        let token = group.token();
        group.spawn("translator", async move {
            let image_id = pump.run(rx, token).await?;
            // The receiver only goes away if the whole build future was dropped.
            let _ = id_tx.send(image_id);
            Ok(())
        });

        (BackendSender::new(tx), id_rx)
    }

    async fn finish(
        &self,
        group: TaskGroup,
        image_id: oneshot::Receiver<String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let errors = group.wait().await;

        if let Some(err) = reconcile(errors, cancel.is_cancelled()) {
            return Err(err);
        }

        image_id
            .await
            .map_err(|_| BuildError::contract("translator finished without an image id"))
    }
}

/// Best-effort remote cancel, bounded by `timeout`.
///
/// Runs after the build's own token has fired, so it must not observe that token.
async fn cancel_remote_build(client: &dyn DaemonClient, build_id: &str, timeout: Duration) {
    info!(build_id = %build_id, "Cancelling build on daemon");
    match tokio::time::timeout(timeout, client.build_cancel(build_id)).await {
        Ok(Ok(())) => debug!(build_id = %build_id, "Daemon accepted build cancellation"),
        Ok(Err(e)) => warn!(build_id = %build_id, "Failed to cancel build: {}", e),
        Err(_) => warn!(build_id = %build_id, "Timed out cancelling build after {:?}", timeout),
    }
}
