//! Image build requests.

use crate::error::{BuildError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default Dockerfile name looked up in the context directory.
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// Which daemon builder runs the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuilderVersion {
    #[default]
    Legacy,
    BuildKit,
}

impl BuilderVersion {
    /// Version string the daemon API expects.
    pub fn api_version(&self) -> &'static str {
        match self {
            BuilderVersion::Legacy => "1",
            BuilderVersion::BuildKit => "2",
        }
    }

    /// Label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            BuilderVersion::Legacy => "legacy",
            BuilderVersion::BuildKit => "buildkit",
        }
    }
}

impl std::fmt::Display for BuilderVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl std::str::FromStr for BuilderVersion {
    type Err = BuildError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "1" | "legacy" => Ok(BuilderVersion::Legacy),
            "2" | "buildkit" => Ok(BuilderVersion::BuildKit),
            _ => Err(BuildError::InvalidRequest {
                reason: format!("Unknown builder version: {}", s),
            }),
        }
    }
}

/// A validated request to build an image from a local context directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuildRequest {
    /// Canonical path of the build context
    pub context_directory: PathBuf,
    /// Canonical path of the Dockerfile, always inside the context
    pub path_to_dockerfile: PathBuf,
    pub build_args: HashMap<String, String>,
    pub image_tags: Vec<String>,
    pub always_pull_base_images: bool,
    pub no_cache: bool,
    pub target_build_stage: Option<String>,
    /// Builder to use; the configured default applies when unset
    pub builder: Option<BuilderVersion>,
}

impl ImageBuildRequest {
    #[must_use]
    pub fn builder(context_directory: impl Into<PathBuf>) -> ImageBuildRequestBuilder {
        ImageBuildRequestBuilder::new(context_directory)
    }

    /// Dockerfile path relative to the context directory, with `/` separators.
    pub fn dockerfile_in_context(&self) -> String {
        let relative = self
            .path_to_dockerfile
            .strip_prefix(&self.context_directory)
            .unwrap_or(&self.path_to_dockerfile);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// File name of the Dockerfile.
    pub fn dockerfile_name(&self) -> String {
        self.path_to_dockerfile
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| DEFAULT_DOCKERFILE.to_string())
    }

    /// Directory holding the Dockerfile.
    pub fn dockerfile_directory(&self) -> &Path {
        self.path_to_dockerfile.parent().unwrap_or(&self.context_directory)
    }
}

/// Builder for [`ImageBuildRequest`].
#[derive(Debug)]
pub struct ImageBuildRequestBuilder {
    context_directory: PathBuf,
    dockerfile: Option<PathBuf>,
    build_args: HashMap<String, String>,
    image_tags: Vec<String>,
    always_pull_base_images: bool,
    no_cache: bool,
    target_build_stage: Option<String>,
    builder: Option<BuilderVersion>,
}

impl ImageBuildRequestBuilder {
    pub fn new(context_directory: impl Into<PathBuf>) -> Self {
        Self {
            context_directory: context_directory.into(),
            dockerfile: None,
            build_args: HashMap::new(),
            image_tags: Vec::new(),
            always_pull_base_images: false,
            no_cache: false,
            target_build_stage: None,
            builder: None,
        }
    }

    /// Set the Dockerfile. Relative paths resolve against the context directory.
    pub fn dockerfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.dockerfile = Some(path.into());
        self
    }

    pub fn build_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.build_args.insert(key.into(), value.into());
        self
    }

    pub fn build_args(mut self, args: impl IntoIterator<Item = (String, String)>) -> Self {
        self.build_args.extend(args);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.image_tags.push(tag.into());
        self
    }

    pub fn always_pull_base_images(mut self, always_pull: bool) -> Self {
        self.always_pull_base_images = always_pull;
        self
    }

    pub fn no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    pub fn target_build_stage(mut self, stage: impl Into<String>) -> Self {
        self.target_build_stage = Some(stage.into());
        self
    }

    pub fn builder(mut self, builder: BuilderVersion) -> Self {
        self.builder = Some(builder);
        self
    }

    /// Validate the paths and build the request.
    pub fn build(self) -> Result<ImageBuildRequest> {
        if !self.context_directory.is_dir() {
            return Err(BuildError::InvalidRequest {
                reason: format!(
                    "Context directory {} does not exist or is not a directory",
                    self.context_directory.display()
                ),
            });
        }

        let context_directory = self
            .context_directory
            .canonicalize()
            .map_err(|e| BuildError::Io { path: self.context_directory.clone(), source: e })?;

        let dockerfile = match self.dockerfile {
            Some(path) if path.is_absolute() => path,
            Some(path) => context_directory.join(path),
            None => context_directory.join(DEFAULT_DOCKERFILE),
        };

        if !dockerfile.is_file() {
            return Err(BuildError::InvalidRequest {
                reason: format!("Dockerfile {} does not exist", dockerfile.display()),
            });
        }

        let path_to_dockerfile = dockerfile
            .canonicalize()
            .map_err(|e| BuildError::Io { path: dockerfile.clone(), source: e })?;

        if !path_to_dockerfile.starts_with(&context_directory) {
            return Err(BuildError::InvalidRequest {
                reason: format!(
                    "Dockerfile {} is not a child of the context directory {}",
                    path_to_dockerfile.display(),
                    context_directory.display()
                ),
            });
        }

        Ok(ImageBuildRequest {
            context_directory,
            path_to_dockerfile,
            build_args: self.build_args,
            image_tags: self.image_tags,
            always_pull_base_images: self.always_pull_base_images,
            no_cache: self.no_cache,
            target_build_stage: self.target_build_stage,
            builder: self.builder,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context_with_dockerfile() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();
        dir
    }

    #[test]
    fn test_builder_version_parsing() {
        assert_eq!("1".parse::<BuilderVersion>().unwrap(), BuilderVersion::Legacy);
        assert_eq!("BuildKit".parse::<BuilderVersion>().unwrap(), BuilderVersion::BuildKit);
        assert_eq!(BuilderVersion::BuildKit.api_version(), "2");

        let err = "3".parse::<BuilderVersion>().unwrap_err();
        assert!(matches!(err, BuildError::InvalidRequest { .. }));
    }

    #[test]
    fn test_defaults_to_dockerfile_in_context() {
        let dir = context_with_dockerfile();

        let request = ImageBuildRequest::builder(dir.path()).tag("app:latest").build().unwrap();

        assert_eq!(request.dockerfile_in_context(), "Dockerfile");
        assert_eq!(request.dockerfile_name(), "Dockerfile");
        assert_eq!(request.image_tags, vec!["app:latest"]);
        assert_eq!(request.builder, None);
    }

    #[test]
    fn test_relative_dockerfile_in_subdirectory() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("docker")).unwrap();
        std::fs::write(dir.path().join("docker/app.Dockerfile"), "FROM alpine\n").unwrap();

        let request = ImageBuildRequest::builder(dir.path())
            .dockerfile("docker/app.Dockerfile")
            .build()
            .unwrap();

        assert_eq!(request.dockerfile_in_context(), "docker/app.Dockerfile");
        assert_eq!(request.dockerfile_name(), "app.Dockerfile");
        assert!(request.dockerfile_directory().ends_with("docker"));
    }

    #[test]
    fn test_missing_context_is_rejected() {
        let dir = TempDir::new().unwrap();

        let err = ImageBuildRequest::builder(dir.path().join("nope")).build().unwrap_err();
        assert!(matches!(err, BuildError::InvalidRequest { .. }));
    }

    #[test]
    fn test_missing_dockerfile_is_rejected() {
        let dir = TempDir::new().unwrap();

        let err = ImageBuildRequest::builder(dir.path()).build().unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_dockerfile_outside_context_is_rejected() {
        let outer = TempDir::new().unwrap();
        std::fs::create_dir(outer.path().join("context")).unwrap();
        std::fs::write(outer.path().join("Dockerfile"), "FROM alpine\n").unwrap();

        let err = ImageBuildRequest::builder(outer.path().join("context"))
            .dockerfile("../Dockerfile")
            .build()
            .unwrap_err();

        assert!(err.to_string().contains("not a child"));
    }
}
