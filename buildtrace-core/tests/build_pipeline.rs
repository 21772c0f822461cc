//! Integration tests for the image build pipeline.
//!
//! These tests drive whole builds through a scripted daemon:
//! - Legacy builds, including context upload progress
//! - BuildKit builds, including session statuses
//! - Callback aborts, caller cancellation and backend failures
//!
//! The mock daemon replays canned response bodies, so no container engine is needed.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use buildtrace_core::{
    BackendSender, BuildError, BuilderVersion, ChannelHandler, ClientConfigFile, Config,
    DaemonClient, ImageBuildOptions, ImageBuildRequest, ImageBuilder, OutputSink, ProgressEvent,
    ProgressHandler, ResponseBody, Result, Session, SolveStatus, Vertex,
};
use prost::Message;
use serde_json::json;
use std::io::Write;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

const IMAGE_ID: &str = "sha256:4f5e6d7c8b9a";

/// Protobuf status batch as the daemon encodes it (vertexes only).
#[derive(Clone, PartialEq, prost::Message)]
struct StatusResponse {
    #[prost(message, repeated, tag = "1")]
    vertexes: Vec<WireVertex>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct WireVertex {
    #[prost(string, tag = "1")]
    digest: String,
    #[prost(string, repeated, tag = "2")]
    inputs: Vec<String>,
    #[prost(string, tag = "3")]
    name: String,
    #[prost(bool, tag = "4")]
    cached: bool,
    #[prost(message, optional, tag = "5")]
    started: Option<prost_types::Timestamp>,
    #[prost(message, optional, tag = "6")]
    completed: Option<prost_types::Timestamp>,
    #[prost(string, tag = "7")]
    error: String,
}

fn line(value: serde_json::Value) -> String {
    format!("{}\n", value)
}

fn stream(text: &str) -> String {
    line(json!({ "stream": text }))
}

fn legacy_result(id: &str) -> String {
    line(json!({ "aux": { "ID": id } }))
}

fn image_id_message(id: &str) -> String {
    line(json!({ "id": "moby.image.id", "aux": { "ID": id } }))
}

fn trace(digest: &str, name: &str, completed: bool) -> String {
    let ts = prost_types::Timestamp { seconds: 1_700_000_000, nanos: 0 };
    let vertex = WireVertex {
        digest: digest.to_string(),
        name: name.to_string(),
        started: Some(ts.clone()),
        completed: completed.then_some(ts),
        ..Default::default()
    };
    let bytes = StatusResponse { vertexes: vec![vertex] }.encode_to_vec();
    line(json!({ "id": "moby.buildkit.trace", "aux": STANDARD.encode(bytes) }))
}

/// Mock daemon (doesn't require a container engine).
#[derive(Default)]
struct MockDaemon {
    body: String,
    /// Keep the response open after the body, like a build still running
    hold_open: bool,
    upload_progress: Vec<i64>,
    session_statuses: Vec<SolveStatus>,
    refuse_builds: bool,
    submitted: Mutex<Vec<ImageBuildOptions>>,
    cancelled: Mutex<Vec<String>>,
    open_responses: Mutex<Vec<DuplexStream>>,
}

impl MockDaemon {
    fn replaying(body: impl Into<String>) -> Self {
        Self { body: body.into(), ..Default::default() }
    }

    fn last_submitted(&self) -> ImageBuildOptions {
        self.submitted.lock().unwrap().last().cloned().expect("no build submitted")
    }

    fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl DaemonClient for MockDaemon {
    fn host(&self) -> String {
        "unix:///var/run/docker.sock".to_string()
    }

    async fn image_build(
        &self,
        options: &ImageBuildOptions,
        upload: Option<BackendSender>,
    ) -> Result<ResponseBody> {
        self.submitted.lock().unwrap().push(options.clone());
        if self.refuse_builds {
            return Err(BuildError::daemon("image_build", "connection refused"));
        }

        if let Some(upload) = upload {
            for bytes in &self.upload_progress {
                upload.context_upload(*bytes).await;
            }
        }

        if !self.hold_open {
            return Ok(Box::pin(std::io::Cursor::new(self.body.clone().into_bytes())));
        }

        let (reader, mut writer) = tokio::io::duplex(64 * 1024);
        writer
            .write_all(self.body.as_bytes())
            .await
            .map_err(|e| BuildError::daemon("image_build", e))?;
        self.open_responses.lock().unwrap().push(writer);
        Ok(Box::pin(reader))
    }

    async fn build_cancel(&self, build_id: &str) -> Result<()> {
        self.cancelled.lock().unwrap().push(build_id.to_string());
        Ok(())
    }

    async fn run_session(
        &self,
        _session: &Session,
        statuses: BackendSender,
        cancel: CancellationToken,
    ) -> Result<()> {
        for status in &self.session_statuses {
            statuses.status(status.clone()).await;
        }
        cancel.cancelled().await;
        Ok(())
    }
}

/// Handler recording every event; aborts on the `abort_on`-th event (1-based).
fn recorder(
    abort_on: Option<usize>,
) -> (impl ProgressHandler + 'static, Arc<Mutex<Vec<ProgressEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let handler = move |event: &ProgressEvent| {
        let mut events = sink.lock().unwrap();
        events.push(event.clone());
        if abort_on == Some(events.len()) {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    };
    (handler, events)
}

#[derive(Clone, Default)]
struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct Fixture {
    dir: TempDir,
    request: ImageBuildRequest,
}

impl Fixture {
    fn new() -> Self {
        Self::with_builder(None)
    }

    fn with_builder(builder: Option<BuilderVersion>) -> Self {
        let dir = TempDir::new().unwrap();
        let context = dir.path().join("app");
        std::fs::create_dir(&context).unwrap();
        std::fs::write(context.join("Dockerfile"), "FROM alpine\nRUN echo hi\n").unwrap();

        let mut request = ImageBuildRequest::builder(&context).tag("app:dev");
        if let Some(builder) = builder {
            request = request.builder(builder);
        }

        Self { request: request.build().unwrap(), dir }
    }

    fn image_builder(&self, daemon: &Arc<MockDaemon>, config: Config) -> ImageBuilder {
        ImageBuilder::new(daemon.clone(), Arc::new(ClientConfigFile::default()), config)
            .with_config_dir(self.dir.path().join("config"))
    }
}

fn buildkit_config() -> Config {
    Config { builder: BuilderVersion::BuildKit, ..Default::default() }
}

fn two_step_legacy_body() -> String {
    [
        stream("Step 1/2 : FROM alpine"),
        stream("\n"),
        stream(" ---> a1b2c3d4e5f6\n"),
        stream("Step 2/2 : RUN echo hi"),
        stream("\n"),
        stream(" ---> Running in 0123456789ab\n"),
        stream("hi\n"),
        stream("Removing intermediate container 0123456789ab\n"),
        stream(" ---> 0fedcba98765\n"),
        legacy_result(IMAGE_ID),
        stream("Successfully built 0fedcba98765\n"),
    ]
    .concat()
}

fn single_step_legacy_body() -> String {
    [stream("Step 1/1 : FROM alpine"), legacy_result(IMAGE_ID)].concat()
}

#[tokio::test]
async fn test_legacy_build_reports_steps_and_image_id() {
    let fixture = Fixture::new();
    let daemon = Arc::new(MockDaemon::replaying(two_step_legacy_body()));
    let builder = fixture.image_builder(&daemon, Config::default());
    let (handler, events) = recorder(None);

    let image_id = builder.build(&fixture.request, handler, CancellationToken::new()).await;

    assert_eq!(image_id.unwrap(), IMAGE_ID);
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            ProgressEvent::StepStarting { step: 1, name: "FROM alpine".into() },
            ProgressEvent::StepFinished { step: 1 },
            ProgressEvent::StepStarting { step: 2, name: "RUN echo hi".into() },
            ProgressEvent::StepOutput { step: 2, output: "hi\n".into() },
            ProgressEvent::StepFinished { step: 2 },
        ]
    );

    let options = daemon.last_submitted();
    assert_eq!(options.version, BuilderVersion::Legacy);
    assert_eq!(options.dockerfile, "Dockerfile");
    assert_eq!(options.tags, vec!["app:dev"]);
    assert_eq!(options.context_directory, Some(fixture.request.context_directory.clone()));
    assert!(daemon.cancelled().is_empty());
}

#[tokio::test]
async fn test_legacy_context_upload_is_reported_before_first_step() {
    let fixture = Fixture::new();
    let daemon = Arc::new(MockDaemon {
        upload_progress: vec![512, 2048],
        ..MockDaemon::replaying(single_step_legacy_body())
    });
    let builder = fixture.image_builder(&daemon, Config::default());
    let (handler, events) = recorder(None);

    builder.build(&fixture.request, handler, CancellationToken::new()).await.unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            ProgressEvent::ContextUploadProgress { step: 0, bytes_uploaded: 512 },
            ProgressEvent::ContextUploadProgress { step: 0, bytes_uploaded: 2048 },
            ProgressEvent::StepStarting { step: 1, name: "FROM alpine".into() },
            ProgressEvent::StepFinished { step: 1 },
        ]
    );
}

#[tokio::test]
async fn test_legacy_context_upload_reporting_can_be_disabled() {
    let fixture = Fixture::new();
    let daemon = Arc::new(MockDaemon {
        upload_progress: vec![512],
        ..MockDaemon::replaying(single_step_legacy_body())
    });
    let config = Config { report_context_upload_progress: false, ..Default::default() };
    let builder = fixture.image_builder(&daemon, config);
    let (handler, events) = recorder(None);

    builder.build(&fixture.request, handler, CancellationToken::new()).await.unwrap();

    let events = events.lock().unwrap();
    assert!(events.iter().all(|e| !matches!(e, ProgressEvent::ContextUploadProgress { .. })));
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn test_backend_error_fails_build() {
    let fixture = Fixture::new();
    let message = "The command '/bin/sh -c false' returned a non-zero code: 1";
    let body = [
        stream("Step 1/1 : RUN false"),
        line(json!({ "errorDetail": { "code": 1, "message": message }, "error": message })),
    ]
    .concat();
    let daemon = Arc::new(MockDaemon::replaying(body));
    let builder = fixture.image_builder(&daemon, Config::default());
    let (handler, events) = recorder(None);

    let err = builder.build(&fixture.request, handler, CancellationToken::new()).await.unwrap_err();

    assert!(matches!(&err, BuildError::BuildFailed { message: m } if m == message));
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            ProgressEvent::StepStarting { step: 1, name: "RUN false".into() },
            ProgressEvent::BuildFailed { message: message.into() },
        ]
    );
}

#[tokio::test]
async fn test_callback_abort_stops_legacy_build() {
    let fixture = Fixture::new();
    let daemon = Arc::new(MockDaemon::replaying(two_step_legacy_body()));
    let builder = fixture.image_builder(&daemon, Config::default());
    let (handler, events) = recorder(Some(1));

    let err = builder.build(&fixture.request, handler, CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, BuildError::CallbackFailed));
    assert_eq!(events.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_submit_failure_is_reported() {
    let fixture = Fixture::new();
    let daemon = Arc::new(MockDaemon { refuse_builds: true, ..Default::default() });
    let builder = fixture.image_builder(&daemon, Config::default());
    let (handler, events) = recorder(None);

    let err = builder.build(&fixture.request, handler, CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, BuildError::Daemon { .. }));
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_buildkit_build_numbers_vertices() {
    let fixture = Fixture::new();
    let body = [
        trace("sha256:d1", "[internal] load build definition from Dockerfile", false),
        trace("sha256:d1", "[internal] load build definition from Dockerfile", true),
        trace("sha256:d2", "[1/2] FROM docker.io/library/alpine", false),
        trace("sha256:d2", "[1/2] FROM docker.io/library/alpine", true),
        trace("sha256:d3", "[2/2] RUN echo hi", false),
        trace("sha256:d3", "[2/2] RUN echo hi", true),
        image_id_message(IMAGE_ID),
    ]
    .concat();
    let daemon = Arc::new(MockDaemon::replaying(body));
    let builder = fixture.image_builder(&daemon, buildkit_config());
    let (handler, events) = recorder(None);

    let image_id = builder.build(&fixture.request, handler, CancellationToken::new()).await;

    assert_eq!(image_id.unwrap(), IMAGE_ID);
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            ProgressEvent::StepStarting {
                step: 1,
                name: "[internal] load build definition from Dockerfile".into()
            },
            ProgressEvent::StepFinished { step: 1 },
            ProgressEvent::StepStarting {
                step: 2,
                name: "[1/2] FROM docker.io/library/alpine".into()
            },
            ProgressEvent::StepFinished { step: 2 },
            ProgressEvent::StepStarting { step: 3, name: "[2/2] RUN echo hi".into() },
            ProgressEvent::StepFinished { step: 3 },
        ]
    );

    let options = daemon.last_submitted();
    assert_eq!(options.version, BuilderVersion::BuildKit);
    assert!(options.session_id.is_some());
    assert_eq!(options.remote_context.as_deref(), Some("client-session"));
    assert!(options.context_directory.is_none());
    assert!(daemon.cancelled().is_empty());
    assert!(fixture.dir.path().join("config/.buildNodeID").exists());
}

#[tokio::test]
async fn test_request_builder_overrides_configured_default() {
    let fixture = Fixture::with_builder(Some(BuilderVersion::BuildKit));
    let daemon = Arc::new(MockDaemon::replaying(image_id_message(IMAGE_ID)));
    let builder = fixture.image_builder(&daemon, Config::default());
    let (handler, _events) = recorder(None);

    builder.build(&fixture.request, handler, CancellationToken::new()).await.unwrap();

    assert_eq!(daemon.last_submitted().version, BuilderVersion::BuildKit);
}

#[tokio::test]
async fn test_buildkit_session_statuses_are_translated() {
    let fixture = Fixture::new();
    let now = SystemTime::now();
    let status = SolveStatus {
        vertexes: vec![Vertex {
            digest: "sha256:auth".to_string(),
            name: "[internal] load metadata for docker.io/library/alpine:latest".to_string(),
            started: Some(now),
            completed: Some(now),
            ..Default::default()
        }],
        ..Default::default()
    };
    let daemon = Arc::new(MockDaemon {
        session_statuses: vec![status],
        ..MockDaemon::replaying(image_id_message(IMAGE_ID))
    });
    let builder = fixture.image_builder(&daemon, buildkit_config());
    let (handler, events) = recorder(None);

    let image_id = builder.build(&fixture.request, handler, CancellationToken::new()).await;

    assert_eq!(image_id.unwrap(), IMAGE_ID);
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            ProgressEvent::StepStarting {
                step: 1,
                name: "[internal] load metadata for docker.io/library/alpine:latest".into()
            },
            ProgressEvent::StepFinished { step: 1 },
        ]
    );
}

#[tokio::test]
async fn test_buildkit_without_image_id_is_protocol_error() {
    let fixture = Fixture::new();
    let body = [
        trace("sha256:d1", "[1/1] FROM alpine", false),
        trace("sha256:d1", "[1/1] FROM alpine", true),
    ]
    .concat();
    let daemon = Arc::new(MockDaemon::replaying(body));
    let builder = fixture.image_builder(&daemon, buildkit_config());
    let (handler, _events) = recorder(None);

    let err = builder.build(&fixture.request, handler, CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, BuildError::BackendProtocol { .. }));
}

#[tokio::test]
async fn test_caller_cancellation_cancels_buildkit_build() {
    let fixture = Fixture::new();
    let daemon = Arc::new(MockDaemon {
        hold_open: true,
        ..MockDaemon::replaying(trace("sha256:d1", "[1/2] FROM alpine", false))
    });
    let builder = fixture.image_builder(&daemon, buildkit_config());
    let (handler, mut rx) = ChannelHandler::new();
    let cancel = CancellationToken::new();

    let (outcome, first) = tokio::join!(
        builder.build(&fixture.request, handler, cancel.clone()),
        async {
            let first = rx.recv().await;
            cancel.cancel();
            first
        }
    );

    assert!(matches!(outcome, Err(BuildError::Cancelled)));
    assert_eq!(
        first,
        Some(ProgressEvent::StepStarting { step: 1, name: "[1/2] FROM alpine".into() })
    );
    let build_id = daemon.last_submitted().build_id.unwrap();
    assert_eq!(daemon.cancelled(), vec![build_id]);
}

#[tokio::test]
async fn test_callback_abort_cancels_buildkit_build() {
    let fixture = Fixture::new();
    let daemon = Arc::new(MockDaemon {
        hold_open: true,
        ..MockDaemon::replaying(trace("sha256:d1", "[1/2] FROM alpine", false))
    });
    let builder = fixture.image_builder(&daemon, buildkit_config());
    let (handler, events) = recorder(Some(1));

    let err = builder.build(&fixture.request, handler, CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, BuildError::CallbackFailed));
    assert_eq!(events.lock().unwrap().len(), 1);
    assert_eq!(daemon.cancelled().len(), 1);
}

#[tokio::test]
async fn test_cancelled_before_start_delivers_nothing() {
    let fixture = Fixture::new();
    let daemon = Arc::new(MockDaemon::replaying(two_step_legacy_body()));
    let builder = fixture.image_builder(&daemon, Config::default());
    let (handler, events) = recorder(None);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = builder.build(&fixture.request, handler, cancel).await.unwrap_err();

    assert!(matches!(err, BuildError::Cancelled));
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_progress_is_rendered_to_output() {
    let fixture = Fixture::new();
    let daemon = Arc::new(MockDaemon::replaying(two_step_legacy_body()));
    let builder = fixture.image_builder(&daemon, Config::default());
    let (handler, _events) = recorder(None);
    let output = SharedOutput::default();

    builder
        .build_with_output(
            &fixture.request,
            handler,
            Some(OutputSink::new(output.clone(), false)),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let rendered = String::from_utf8(output.0.lock().unwrap().clone()).unwrap();
    assert!(rendered.contains("Step 2/2 : RUN echo hi"));
    assert!(rendered.contains("hi\n"));
}

#[tokio::test]
async fn test_configured_color_applies_to_output() {
    colored::control::set_override(true);
    let message = "The command '/bin/sh -c false' returned a non-zero code: 1";
    let body = [
        stream("Step 1/1 : RUN false"),
        line(json!({ "errorDetail": { "code": 1, "message": message }, "error": message })),
    ]
    .concat();

    let mut rendered = Vec::new();
    for color_output in [true, false] {
        let fixture = Fixture::new();
        let daemon = Arc::new(MockDaemon::replaying(body.clone()));
        let builder =
            fixture.image_builder(&daemon, Config { color_output, ..Default::default() });
        let (handler, _events) = recorder(None);
        let output = SharedOutput::default();

        let err = builder
            .build_with_output(
                &fixture.request,
                handler,
                Some(builder.output_to(output.clone())),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::BuildFailed { .. }));

        rendered.push(String::from_utf8(output.0.lock().unwrap().clone()).unwrap());
    }

    assert!(rendered[0].contains("\u{1b}["));
    assert!(rendered[0].contains(message));
    assert!(!rendered[1].contains("\u{1b}["));
    assert!(rendered[1].contains(&format!("ERROR: {}", message)));
}

#[tokio::test]
async fn test_build_to_stdout_returns_image_id() {
    let fixture = Fixture::new();
    let daemon = Arc::new(MockDaemon::replaying(single_step_legacy_body()));
    let builder = fixture.image_builder(&daemon, Config::default());
    let (handler, events) = recorder(None);

    let image_id =
        builder.build_to_stdout(&fixture.request, handler, CancellationToken::new()).await.unwrap();

    assert_eq!(image_id, IMAGE_ID);
    assert_eq!(events.lock().unwrap().last(), Some(&ProgressEvent::StepFinished { step: 1 }));
}
