//! Translation of BuildKit solve status batches into step events.
//!
//! Each vertex becomes one step, numbered in order of first appearance. The
//! digest → step table lives for the whole build; a separate completed set
//! lets a vertex that reports completion, then reports running again, be
//! announced as a restart of the same step.

use crate::error::{BuildError, Result};
use crate::events::{ProgressCallback, PullProgressDetail, PullProgressUpdate};
use crate::graph::{order_vertices, SolveStatus};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Status name BuildKit uses for local context transfer.
const TRANSFERRING_STATUS: &str = "transferring";

/// Prefix of status ids for layer extraction sub-operations.
const EXTRACTING_ID_PREFIX: &str = "extracting ";

/// Step bookkeeping for one BuildKit build.
#[derive(Debug, Default)]
pub struct VertexTracer {
    step_numbers: HashMap<String, u64>,
    completed: HashSet<String>,
}

impl VertexTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Step number allocated to a vertex.
    ///
    /// The backend always announces a vertex before reporting anything else about it,
    /// so an unknown digest is a contract violation.
    pub fn step_number(&self, digest: &str) -> Result<u64> {
        self.step_numbers.get(digest).copied().ok_or_else(|| {
            BuildError::contract(format!("vertex {} referenced before it started", digest))
        })
    }

    /// Translate one batch of solve status.
    ///
    /// A vertex carrying an error emits `BuildFailed` and returns [`BuildError::BuildFailed`].
    pub fn on_status(
        &mut self,
        status: &SolveStatus,
        callback: &mut ProgressCallback,
    ) -> Result<()> {
        let vertices = order_vertices(&status.vertexes)?;

        for vertex in &vertices {
            if !self.step_numbers.contains_key(&vertex.digest) {
                if vertex.is_started() || vertex.is_completed() {
                    let step = self.allocate_step_number(&vertex.digest);
                    callback.step_starting(step, &vertex.name)?;
                }
            } else if !vertex.is_completed() && self.completed.remove(&vertex.digest) {
                let step = self.step_number(&vertex.digest)?;
                debug!(step, digest = %vertex.digest, "Vertex restarted");
                callback.step_starting(step, &vertex.name)?;
            }
        }

        for s in &status.statuses {
            let step = self.step_number(&s.vertex)?;

            if s.name == TRANSFERRING_STATUS {
                callback.context_upload_progress(step, s.current)?;
            } else if !s.name.is_empty() {
                let id = s.id.strip_prefix(EXTRACTING_ID_PREFIX).unwrap_or(&s.id);
                let detail = PullProgressDetail { current: s.current, total: s.total };
                let update = PullProgressUpdate::new(&s.name, Some(detail), id);
                callback.step_pull_progress(step, update)?;
            }
        }

        for log in &status.logs {
            let step = self.step_number(&log.vertex)?;
            callback.step_output(step, &String::from_utf8_lossy(&log.data))?;
        }

        for vertex in &vertices {
            if !vertex.error.is_empty() {
                callback.build_failed(&vertex.error)?;
                return Err(BuildError::BuildFailed { message: vertex.error.clone() });
            }

            if vertex.is_completed() && !self.completed.contains(&vertex.digest) {
                let step = self.step_number(&vertex.digest)?;
                self.completed.insert(vertex.digest.clone());
                callback.step_finished(step)?;
            }
        }

        Ok(())
    }

    /// The daemon reported a build error outside of any vertex.
    pub fn on_build_failed(
        &mut self,
        message: &str,
        callback: &mut ProgressCallback,
    ) -> Result<()> {
        callback.build_failed(message)?;
        Err(BuildError::BuildFailed { message: message.to_string() })
    }

    fn allocate_step_number(&mut self, digest: &str) -> u64 {
        let step = self.step_numbers.len() as u64 + 1;
        self.step_numbers.insert(digest.to_string(), step);
        step
    }
}
