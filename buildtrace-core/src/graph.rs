//! BuildKit solve status model and display ordering.
//!
//! BuildKit reports progress as batches of vertices (nodes of the build graph,
//! keyed by content digest), statuses (named byte counters attributed to a
//! vertex) and logs (raw output attributed to a vertex). Batches arrive on the
//! daemon's JSON stream as base64-encoded protobuf `StatusResponse` messages.

use crate::error::{BuildError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use prost::Message;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Prefix of vertices BuildKit runs on its own behalf.
const INTERNAL_PREFIX: &str = "[internal] ";

/// Prefix of the vertex that loads the build definition (Dockerfile).
const LOAD_DEFINITION_PREFIX: &str = "[internal] load build definition ";

/// Name of the vertex that writes the final image.
const EXPORTING_NAME: &str = "exporting to image";

/// A node of the build graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vertex {
    /// Content digest identifying the vertex across the whole build
    pub digest: String,
    /// Digests this vertex depends on
    pub inputs: Vec<String>,
    pub name: String,
    pub started: Option<SystemTime>,
    pub completed: Option<SystemTime>,
    /// Non-empty if the vertex failed
    pub error: String,
    pub cached: bool,
}

impl Vertex {
    pub fn is_started(&self) -> bool {
        self.started.is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.is_some()
    }
}

/// A named progress counter attributed to a vertex.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VertexStatus {
    pub id: String,
    /// Digest of the owning vertex
    pub vertex: String,
    pub name: String,
    pub current: i64,
    pub total: i64,
    pub timestamp: Option<SystemTime>,
    pub started: Option<SystemTime>,
    pub completed: Option<SystemTime>,
}

/// A chunk of output attributed to a vertex.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VertexLog {
    /// Digest of the owning vertex
    pub vertex: String,
    /// 1 = stdout, 2 = stderr
    pub stream: i64,
    pub data: Vec<u8>,
    pub timestamp: Option<SystemTime>,
}

/// One batch of solve progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolveStatus {
    pub vertexes: Vec<Vertex>,
    pub statuses: Vec<VertexStatus>,
    pub logs: Vec<VertexLog>,
}

impl SolveStatus {
    pub fn is_empty(&self) -> bool {
        self.vertexes.is_empty() && self.statuses.is_empty() && self.logs.is_empty()
    }

    /// Decode the `aux` payload of a `moby.buildkit.trace` message.
    ///
    /// The payload is a JSON string holding a base64-encoded protobuf `StatusResponse`.
    pub fn from_trace_aux(aux: &serde_json::Value) -> Result<Self> {
        let encoded = aux
            .as_str()
            .ok_or_else(|| BuildError::protocol("trace payload is not a string"))?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| BuildError::protocol(format!("trace payload is not base64: {}", e)))?;
        Self::decode_status_response(&bytes)
    }

    /// Decode a protobuf `StatusResponse`.
    pub fn decode_status_response(bytes: &[u8]) -> Result<Self> {
        let response = wire::StatusResponse::decode(bytes)
            .map_err(|e| BuildError::protocol(format!("invalid trace message: {}", e)))?;
        Ok(response.into())
    }
}

/// Protobuf shapes of the BuildKit control API status messages.
pub(crate) mod wire {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StatusResponse {
        #[prost(message, repeated, tag = "1")]
        pub vertexes: Vec<Vertex>,
        #[prost(message, repeated, tag = "2")]
        pub statuses: Vec<VertexStatus>,
        #[prost(message, repeated, tag = "3")]
        pub logs: Vec<VertexLog>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Vertex {
        #[prost(string, tag = "1")]
        pub digest: String,
        #[prost(string, repeated, tag = "2")]
        pub inputs: Vec<String>,
        #[prost(string, tag = "3")]
        pub name: String,
        #[prost(bool, tag = "4")]
        pub cached: bool,
        #[prost(message, optional, tag = "5")]
        pub started: Option<prost_types::Timestamp>,
        #[prost(message, optional, tag = "6")]
        pub completed: Option<prost_types::Timestamp>,
        #[prost(string, tag = "7")]
        pub error: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct VertexStatus {
        #[prost(string, tag = "1")]
        pub id: String,
        #[prost(string, tag = "2")]
        pub vertex: String,
        #[prost(string, tag = "3")]
        pub name: String,
        #[prost(int64, tag = "4")]
        pub current: i64,
        #[prost(int64, tag = "5")]
        pub total: i64,
        #[prost(message, optional, tag = "6")]
        pub timestamp: Option<prost_types::Timestamp>,
        #[prost(message, optional, tag = "7")]
        pub started: Option<prost_types::Timestamp>,
        #[prost(message, optional, tag = "8")]
        pub completed: Option<prost_types::Timestamp>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct VertexLog {
        #[prost(string, tag = "1")]
        pub vertex: String,
        #[prost(message, optional, tag = "2")]
        pub timestamp: Option<prost_types::Timestamp>,
        #[prost(int64, tag = "3")]
        pub stream: i64,
        #[prost(bytes = "vec", tag = "4")]
        pub msg: Vec<u8>,
    }
}

fn to_system_time(ts: Option<prost_types::Timestamp>) -> Option<SystemTime> {
    let ts = ts?;
    let seconds = u64::try_from(ts.seconds).ok()?;
    let nanos = u32::try_from(ts.nanos).ok()?;
    UNIX_EPOCH.checked_add(Duration::new(seconds, nanos))
}

impl From<wire::StatusResponse> for SolveStatus {
    fn from(resp: wire::StatusResponse) -> Self {
        Self {
            vertexes: resp
                .vertexes
                .into_iter()
                .map(|v| Vertex {
                    digest: v.digest,
                    inputs: v.inputs,
                    name: v.name,
                    started: to_system_time(v.started),
                    completed: to_system_time(v.completed),
                    error: v.error,
                    cached: v.cached,
                })
                .collect(),
            statuses: resp
                .statuses
                .into_iter()
                .map(|s| VertexStatus {
                    id: s.id,
                    vertex: s.vertex,
                    name: s.name,
                    current: s.current,
                    total: s.total,
                    timestamp: to_system_time(s.timestamp),
                    started: to_system_time(s.started),
                    completed: to_system_time(s.completed),
                })
                .collect(),
            logs: resp
                .logs
                .into_iter()
                .map(|l| VertexLog {
                    vertex: l.vertex,
                    stream: l.stream,
                    data: l.msg,
                    timestamp: to_system_time(l.timestamp),
                })
                .collect(),
        }
    }
}

/// Display class of a vertex, derived from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DisplayClass {
    /// `[internal] ...`; the build definition loader sorts first
    Internal { loads_definition: bool },
    /// `[stage step/total] ...` (stage may be empty)
    Stage { stage: String, step: Option<u64> },
    /// No bracket prefix
    Unprefixed,
    /// The image export, shown after everything else
    Exporting,
}

impl DisplayClass {
    fn of(name: &str) -> Self {
        if name == EXPORTING_NAME {
            return DisplayClass::Exporting;
        }

        if name.starts_with(INTERNAL_PREFIX) {
            return DisplayClass::Internal {
                loads_definition: name.starts_with(LOAD_DEFINITION_PREFIX),
            };
        }

        let Some(inner) = name.strip_prefix('[').and_then(|rest| rest.split_once(']')) else {
            return DisplayClass::Unprefixed;
        };
        let inner = inner.0.trim();

        let (stage, counter) = match inner.rsplit_once(' ') {
            Some((stage, counter)) => (stage.trim(), counter),
            None => ("", inner),
        };

        match counter.split_once('/').and_then(|(step, _)| step.parse::<u64>().ok()) {
            Some(step) => DisplayClass::Stage { stage: stage.to_string(), step: Some(step) },
            None => DisplayClass::Stage { stage: inner.to_string(), step: None },
        }
    }

    fn rank(&self) -> u8 {
        match self {
            DisplayClass::Internal { loads_definition: true } => 0,
            DisplayClass::Internal { loads_definition: false } => 1,
            DisplayClass::Stage { .. } => 2,
            DisplayClass::Unprefixed => 3,
            DisplayClass::Exporting => 4,
        }
    }
}

/// Order one batch of vertices for display.
///
/// The result is stable with respect to batch order, except that:
/// - a vertex always follows any vertex of the same batch it lists as an input;
/// - bracket-prefixed vertices precede unprefixed ones;
/// - `[internal]` vertices precede stage vertices, the build definition loader first;
/// - vertices of the same stage are ordered by their step counter, while vertices of
///   different stages keep their relative batch positions;
/// - `exporting to image` follows every other vertex.
///
/// Returns a contract violation if the batch's input relation contains a cycle.
pub fn order_vertices(vertices: &[Vertex]) -> Result<Vec<&Vertex>> {
    let classes: Vec<DisplayClass> = vertices.iter().map(|v| DisplayClass::of(&v.name)).collect();

    let mut display: Vec<usize> = (0..vertices.len()).collect();
    display.sort_by_key(|&i| classes[i].rank());
    sort_within_stages(&mut display, &classes);

    let order = dependency_order(vertices, &display)?;
    Ok(order.into_iter().map(|i| &vertices[i]).collect())
}

/// Sort stage vertices by step counter within each stage, leaving the slots each
/// stage occupies untouched.
fn sort_within_stages(display: &mut [usize], classes: &[DisplayClass]) {
    let mut slots_by_stage: HashMap<&str, Vec<usize>> = HashMap::new();
    for (slot, &i) in display.iter().enumerate() {
        if let DisplayClass::Stage { stage, .. } = &classes[i] {
            slots_by_stage.entry(stage.as_str()).or_default().push(slot);
        }
    }

    for slots in slots_by_stage.values() {
        let mut members: Vec<usize> = slots.iter().map(|&slot| display[slot]).collect();
        members.sort_by_key(|&i| match &classes[i] {
            DisplayClass::Stage { step, .. } => step.unwrap_or(u64::MAX),
            _ => u64::MAX,
        });
        for (&slot, member) in slots.iter().zip(members) {
            display[slot] = member;
        }
    }
}

/// Stable topological order: repeatedly take the earliest vertex (by display
/// position) whose in-batch inputs have all been taken.
fn dependency_order(vertices: &[Vertex], display: &[usize]) -> Result<Vec<usize>> {
    let mut positions_by_digest: HashMap<&str, Vec<usize>> = HashMap::new();
    for (position, &i) in display.iter().enumerate() {
        positions_by_digest.entry(vertices[i].digest.as_str()).or_default().push(position);
    }

    let mut pending = vec![0usize; display.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); display.len()];

    for (position, &i) in display.iter().enumerate() {
        for input in &vertices[i].inputs {
            for &dependency in positions_by_digest.get(input.as_str()).into_iter().flatten() {
                pending[position] += 1;
                dependents[dependency].push(position);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..display.len()).filter(|&p| pending[p] == 0).collect();
    let mut order = Vec::with_capacity(display.len());

    while let Some(position) = ready.pop_first() {
        order.push(display[position]);
        for &dependent in &dependents[position] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != display.len() {
        let cycle: Vec<&str> = (0..display.len())
            .filter(|&p| pending[p] > 0)
            .map(|p| vertices[display[p]].digest.as_str())
            .collect();
        return Err(BuildError::contract(format!(
            "cyclic vertex inputs in status batch: {:?}",
            cycle
        )));
    }

    Ok(order)
}
