//! Legacy builder progress parsing.
//!
//! The legacy builder reports progress as a stream of JSON messages carrying
//! free text (`stream`), named progress updates (`status`/`progressDetail`),
//! errors and an `aux` result payload. Step boundaries are only visible as
//! `Step <n>/<total> : <instruction>` text lines, so this parser reconstructs
//! the step lifecycle from the text and filters out the synthetic lines the
//! daemon prints around each step.

use crate::error::{BuildError, Result};
use crate::events::{ProgressCallback, PullProgressDetail, PullProgressUpdate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

static STEP_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Step ([0-9]+)/([0-9]+) : (.*)$").expect("Invalid step line regex")
});

static RUNNING_IN_CONTAINER_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ ---> Running in [0-9a-f]{12}\n$").expect("Invalid running-in regex")
});

static REMOVING_INTERMEDIATE_CONTAINER_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Removing intermediate container [0-9a-f]{12}\n$")
        .expect("Invalid removing-container regex")
});

// Heuristic: a build step printing exactly this shape is indistinguishable from the
// daemon's layer id line and is suppressed too.
static STEP_FINISHED_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ ---> [0-9a-f]{12}\n$").expect("Invalid step finished regex"));

static BUILD_SUCCESSFULLY_FINISHED_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Successfully built [0-9a-f]{12}\n$").expect("Invalid build finished regex")
});

/// Instruction prefixes whose steps fetch images rather than run commands.
const TRANSFER_VERBS: &[&str] = &["FROM "];

/// Byte counts of a progress message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct JsonProgress {
    #[serde(default)]
    pub current: i64,
    #[serde(default)]
    pub total: i64,
}

/// Error payload of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct JsonError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// One message of the daemon's JSON progress stream.
///
/// Also used as the envelope of BuildKit trace messages.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JsonMessage {
    #[serde(default)]
    pub stream: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, rename = "progressDetail")]
    pub progress: Option<JsonProgress>,
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "errorDetail")]
    pub error: Option<JsonError>,
    #[serde(default, rename = "error")]
    pub error_message: String,
    #[serde(default)]
    pub aux: Option<serde_json::Value>,
}

impl JsonMessage {
    /// The error reported by this message, if any.
    pub fn failure(&self) -> Option<&str> {
        match &self.error {
            Some(err) => Some(err.message.as_str()),
            None if !self.error_message.is_empty() => Some(self.error_message.as_str()),
            None => None,
        }
    }
}

/// Result payload carried in `aux` by the last message of a build.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildResultPayload {
    #[serde(rename = "ID")]
    pub id: String,
}

/// Translates legacy builder messages into step lifecycle events.
#[derive(Debug, Default)]
pub struct LegacyStreamParser {
    /// Step currently open (0 = none yet)
    current_step: u64,
    current_step_is_transfer_step: bool,
    have_seen_meaningful_output: bool,
    have_seen_step_finished_marker: bool,
    image_id: Option<String>,
}

impl LegacyStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one message from the stream.
    ///
    /// A message carrying an error emits `BuildFailed` and returns
    /// [`BuildError::BuildFailed`].
    pub fn on_message(&mut self, msg: &JsonMessage, callback: &mut ProgressCallback) -> Result<()> {
        if !msg.stream.is_empty() {
            self.on_build_output(&msg.stream, callback)?;
        }

        if !msg.status.is_empty() || msg.progress.is_some() {
            self.on_progress(msg, callback)?;
        }

        if let Some(message) = msg.failure() {
            callback.build_failed(message)?;
            return Err(BuildError::BuildFailed { message: message.to_string() });
        }

        if let Some(aux) = &msg.aux {
            match serde_json::from_value::<BuildResultPayload>(aux.clone()) {
                Ok(result) => {
                    debug!(image_id = %result.id, "Received build result");
                    self.image_id = Some(result.id);
                }
                Err(e) => debug!("Ignoring unrecognised aux payload: {}", e),
            }
        }

        Ok(())
    }

    /// Context upload progress is attributed to the step open at the time (0 before the first).
    pub fn on_context_upload(&mut self, bytes: i64, callback: &mut ProgressCallback) -> Result<()> {
        callback.context_upload_progress(self.current_step, bytes)
    }

    /// Finish parsing at end of stream, returning the built image id if one was reported.
    pub fn finish(&mut self, callback: &mut ProgressCallback) -> Result<Option<String>> {
        if self.image_id.is_some() && self.current_step != 0 {
            callback.step_finished(self.current_step)?;
        }

        Ok(self.image_id.take())
    }

    /// # Panics
    ///
    /// Panics if a step line matches but its step number does not fit in a `u64`;
    /// the daemon only ever sends small numeric step numbers.
    fn on_build_output(&mut self, stream: &str, callback: &mut ProgressCallback) -> Result<()> {
        if let Some(captures) = STEP_LINE.captures(stream) {
            let new_step: u64 = captures[1].parse().unwrap_or_else(|e| {
                panic!("step number '{}' matched the step line pattern: {}", &captures[1], e)
            });
            let step_name = &captures[3];

            if self.current_step != 0 {
                callback.step_finished(self.current_step)?;
            }

            self.current_step = new_step;
            self.current_step_is_transfer_step = is_transfer_step(step_name);
            self.have_seen_meaningful_output = false;
            self.have_seen_step_finished_marker = false;

            return callback.step_starting(new_step, step_name);
        }

        if !self.have_seen_meaningful_output && stream == "\n" {
            return Ok(());
        }

        if !self.have_seen_meaningful_output && RUNNING_IN_CONTAINER_LINE.is_match(stream) {
            return Ok(());
        }

        if REMOVING_INTERMEDIATE_CONTAINER_LINE.is_match(stream) {
            return Ok(());
        }

        if STEP_FINISHED_LINE.is_match(stream) {
            self.have_seen_step_finished_marker = true;
            return Ok(());
        }

        if self.have_seen_step_finished_marker && BUILD_SUCCESSFULLY_FINISHED_LINE.is_match(stream)
        {
            return Ok(());
        }

        self.have_seen_meaningful_output = true;
        callback.step_output(self.current_step, stream)
    }

    fn on_progress(&mut self, msg: &JsonMessage, callback: &mut ProgressCallback) -> Result<()> {
        if self.current_step_is_transfer_step {
            let detail =
                msg.progress.map(|p| PullProgressDetail { current: p.current, total: p.total });
            let update = PullProgressUpdate::new(&msg.status, detail, &msg.id);
            return callback.step_pull_progress(self.current_step, update);
        }

        let progress = msg.progress.unwrap_or_default();
        callback.step_download_progress(self.current_step, progress.current, progress.total)
    }
}

fn is_transfer_step(step_name: &str) -> bool {
    let upper = step_name.to_uppercase();
    TRANSFER_VERBS.iter().any(|verb| upper.starts_with(verb))
}
