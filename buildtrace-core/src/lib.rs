//! Buildtrace Core Library
//!
//! Runs container image builds through a daemon and reports their progress as
//! one ordered stream of step events, whichever builder the daemon uses.

pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod graph;
pub mod legacy;
pub mod observability;
pub mod orchestrator;
pub mod output;
pub mod paths;
pub mod request;
pub mod stream;
pub mod tracer;
pub mod translator;

// Re-export commonly used items
pub use client::{DaemonClient, ImageBuildOptions, ResponseBody, Session};
pub use config::Config;
pub use credentials::{AuthConfig, ClientConfigFile, CredentialProvider, ProxySettings};
pub use error::{BuildError, ErrorKind, Result};
pub use events::{
    ChannelHandler, ProgressEvent, ProgressHandler, PullProgressDetail, PullProgressUpdate,
};
pub use graph::{SolveStatus, Vertex, VertexLog, VertexStatus};
pub use observability::init as init_observability;
pub use orchestrator::ImageBuilder;
pub use output::OutputSink;
pub use request::{BuilderVersion, ImageBuildRequest, ImageBuildRequestBuilder};
pub use translator::{BackendMessage, BackendSender};
