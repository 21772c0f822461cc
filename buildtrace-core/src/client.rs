//! Daemon collaborator seam.
//!
//! The pipeline never talks to the daemon directly. Everything it needs
//! (submitting a build, cancelling it, running the BuildKit session) goes
//! through [`DaemonClient`], so transports and test doubles plug in the same way.

use crate::credentials::{AuthConfig, CredentialProvider};
use crate::error::Result;
use crate::paths;
use crate::request::{BuilderVersion, ImageBuildRequest};
use crate::translator::BackendSender;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Body of the daemon's build response: newline-delimited JSON messages.
pub type ResponseBody = Pin<Box<dyn AsyncRead + Send>>;

/// Remote context value telling the daemon to fetch the context over the session.
pub const SESSION_REMOTE_CONTEXT: &str = "client-session";

/// Options sent with an image build request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageBuildOptions {
    pub version: BuilderVersion,
    /// Local directory to upload as the build context (legacy builder only)
    pub context_directory: Option<PathBuf>,
    pub dockerfile: String,
    pub build_args: HashMap<String, String>,
    pub tags: Vec<String>,
    pub pull_parent: bool,
    pub no_cache: bool,
    pub target: String,
    /// Remove intermediate containers after a successful build
    pub remove: bool,
    pub auth_configs: HashMap<String, AuthConfig>,
    pub session_id: Option<String>,
    pub build_id: Option<String>,
    pub remote_context: Option<String>,
}

impl ImageBuildOptions {
    fn common(
        request: &ImageBuildRequest,
        credentials: &dyn CredentialProvider,
        host: &str,
    ) -> Self {
        let mut build_args = request.build_args.clone();
        credentials.proxy_settings(host).apply_to(&mut build_args);

        Self {
            build_args,
            tags: request.image_tags.clone(),
            pull_parent: request.always_pull_base_images,
            no_cache: request.no_cache,
            target: request.target_build_stage.clone().unwrap_or_default(),
            remove: true,
            ..Default::default()
        }
    }

    /// Options for the legacy builder: the context is uploaded with the request
    /// and credentials travel in the options.
    pub fn legacy(
        request: &ImageBuildRequest,
        credentials: &dyn CredentialProvider,
        host: &str,
    ) -> Self {
        Self {
            version: BuilderVersion::Legacy,
            context_directory: Some(request.context_directory.clone()),
            dockerfile: request.dockerfile_in_context(),
            auth_configs: credentials.all_credentials(),
            ..Self::common(request, credentials, host)
        }
    }

    /// Options for BuildKit: the context and credentials are served over `session`.
    pub fn buildkit(
        request: &ImageBuildRequest,
        session: &Session,
        credentials: &dyn CredentialProvider,
        host: &str,
    ) -> Self {
        Self {
            version: BuilderVersion::BuildKit,
            dockerfile: request.dockerfile_name(),
            session_id: Some(session.id.clone()),
            build_id: Some(generate_random_id()),
            remote_context: Some(SESSION_REMOTE_CONTEXT.to_string()),
            ..Self::common(request, credentials, host)
        }
    }
}

/// Side channel the BuildKit daemon uses to pull the context and credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    /// Base name of the context directory
    pub name: String,
    /// Stable per machine and context directory, lets the daemon reuse transfers
    pub shared_key: String,
    /// Synced to the daemon as `context`
    pub context_directory: PathBuf,
    /// Synced to the daemon as `dockerfile`
    pub dockerfile_directory: PathBuf,
}

impl Session {
    pub fn new(request: &ImageBuildRequest, node_id: &str) -> Self {
        let name = request
            .context_directory
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        Self {
            id: Uuid::new_v4().simple().to_string(),
            name,
            shared_key: build_shared_key(node_id, &request.context_directory),
            context_directory: request.context_directory.clone(),
            dockerfile_directory: request.dockerfile_directory().to_path_buf(),
        }
    }
}

/// Hex SHA-256 of `"<node id>:<context dir>"`.
pub fn build_shared_key(node_id: &str, context_directory: &Path) -> String {
    let digest = Sha256::digest(format!("{}:{}", node_id, context_directory.display()));
    format!("{:x}", digest)
}

/// Random 64-character hex identifier.
pub fn generate_random_id() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// This machine's build node identifier, persisted in the configuration directory.
///
/// Created on first use. If the file cannot be created or read, the directory
/// path itself is used.
pub fn node_identifier(config_dir: &Path) -> String {
    let fallback = config_dir.to_string_lossy().to_string();
    let path = paths::build_node_id_path(config_dir);

    if std::fs::create_dir_all(config_dir).is_err() {
        return fallback;
    }

    if !path.exists() {
        if let Err(e) = std::fs::write(&path, generate_random_id()) {
            debug!(path = %path.display(), "Could not persist build node id: {}", e);
            return fallback;
        }
    }

    std::fs::read_to_string(&path).unwrap_or(fallback)
}

/// Operations the pipeline needs from the daemon.
#[async_trait]
pub trait DaemonClient: Send + Sync {
    /// Address of the daemon, used to pick proxy settings.
    fn host(&self) -> String;

    /// Submit a build and return the response body.
    ///
    /// When `upload` is set, the client reports the running total of context bytes
    /// sent through it and stops uploading once it reports the translator gone.
    async fn image_build(
        &self,
        options: &ImageBuildOptions,
        upload: Option<BackendSender>,
    ) -> Result<ResponseBody>;

    /// Ask the daemon to cancel an in-flight BuildKit build.
    async fn build_cancel(&self, build_id: &str) -> Result<()>;

    /// Serve a BuildKit session until `cancel` fires or the daemon closes it.
    ///
    /// Solve statuses produced while serving (e.g. registry auth) go to `statuses`.
    async fn run_session(
        &self,
        session: &Session,
        statuses: BackendSender,
        cancel: CancellationToken,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::ClientConfigFile;
    use tempfile::TempDir;

    fn request(dir: &TempDir) -> ImageBuildRequest {
        std::fs::create_dir(dir.path().join("app")).unwrap();
        std::fs::write(dir.path().join("app/Dockerfile"), "FROM alpine\n").unwrap();
        ImageBuildRequest::builder(dir.path().join("app"))
            .build_arg("VERSION", "1")
            .tag("app:dev")
            .target_build_stage("release")
            .build()
            .unwrap()
    }

    fn credentials() -> ClientConfigFile {
        ClientConfigFile::parse(
            r#"{"auths": {"r.io": {"auth": "dTpw"}}, "proxies": {"default": {"httpProxy": "p"}}}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_legacy_options() {
        let dir = TempDir::new().unwrap();
        let request = request(&dir);

        let options = ImageBuildOptions::legacy(&request, &credentials(), "unix:///sock");

        assert_eq!(options.version, BuilderVersion::Legacy);
        assert_eq!(options.dockerfile, "Dockerfile");
        assert_eq!(options.context_directory, Some(request.context_directory.clone()));
        assert_eq!(options.auth_configs["r.io"].username, "u");
        assert_eq!(options.build_args["VERSION"], "1");
        assert_eq!(options.build_args["HTTP_PROXY"], "p");
        assert_eq!(options.target, "release");
        assert!(options.remove);
        assert!(options.build_id.is_none());
    }

    #[test]
    fn test_buildkit_options_use_session() {
        let dir = TempDir::new().unwrap();
        let request = request(&dir);
        let session = Session::new(&request, "node");

        let options = ImageBuildOptions::buildkit(&request, &session, &credentials(), "");

        assert_eq!(options.version, BuilderVersion::BuildKit);
        assert_eq!(options.session_id.as_deref(), Some(session.id.as_str()));
        assert_eq!(options.remote_context.as_deref(), Some(SESSION_REMOTE_CONTEXT));
        assert_eq!(options.build_id.as_ref().map(|id| id.len()), Some(64));
        assert!(options.auth_configs.is_empty());
        assert!(options.context_directory.is_none());
        assert_eq!(session.name, "app");
    }

    #[test]
    fn test_shared_key_is_stable_per_node_and_dir() {
        let a = build_shared_key("node", Path::new("/src/app"));
        assert_eq!(a, build_shared_key("node", Path::new("/src/app")));
        assert_ne!(a, build_shared_key("other", Path::new("/src/app")));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_node_identifier_is_persisted() {
        let dir = TempDir::new().unwrap();

        let first = node_identifier(dir.path());
        let second = node_identifier(dir.path());

        assert_eq!(first.len(), 64);
        assert_eq!(first, second);
        assert!(paths::build_node_id_path(dir.path()).exists());
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(generate_random_id(), generate_random_id());
    }
}
