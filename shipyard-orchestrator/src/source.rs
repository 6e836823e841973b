//! Source providers
//!
//! The Source stage turns a revision into a checked out directory and wraps
//! it in the artifact the Build stage consumes. Every failure, whether the
//! repository is unreachable or rejects the credentials, is reported as
//! `SourceUnavailable`.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use shipyard_core::domain::artifact::Artifact;
use shipyard_core::domain::secret::{SecretKeyRef, SecretResolver};
use shipyard_core::domain::stage::{SOURCE_OUTPUT, StageName};
use shipyard_core::dto::trigger::check_revision;
use shipyard_core::error::FailureCause;

/// Fetches a revision into a directory
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn fetch(&self, revision: &str, destination: &Path) -> Result<Artifact, FailureCause>;
}

fn unavailable(message: impl Into<String>) -> FailureCause {
    FailureCause::SourceUnavailable {
        message: message.into(),
    }
}

// =============================================================================
// Git
// =============================================================================

/// Shallow fetch of a single revision with git
pub struct GitSource {
    url: String,
    /// Access token, resolved only when fetching
    token: Option<SecretKeyRef>,
    secrets: Arc<dyn SecretResolver>,
}

impl GitSource {
    pub fn new(
        url: impl Into<String>,
        token: Option<SecretKeyRef>,
        secrets: Arc<dyn SecretResolver>,
    ) -> Self {
        Self {
            url: url.into(),
            token,
            secrets,
        }
    }

    /// Runs git in `dir`; the arguments never appear in errors since they
    /// may carry the token
    async fn git(&self, dir: &Path, step: &str, args: &[String]) -> Result<(), FailureCause> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| unavailable(format!("git {} could not start: {}", step, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(unavailable(format!(
                "git {} of {} failed: {}",
                step,
                self.url,
                stderr.trim()
            )));
        }

        Ok(())
    }
}

impl GitSource {
    /// Arguments of the shallow fetch; `--` keeps the URL and revision from
    /// being read as options
    fn fetch_args(&self, revision: &str) -> Result<Vec<String>, FailureCause> {
        let mut args = Vec::new();
        if let Some(reference) = &self.token {
            let token = self.secrets.resolve(reference).map_err(|cause| {
                unavailable(format!("cannot resolve source token {}: {}", reference, cause))
            })?;
            args.push("-c".to_string());
            args.push(format!(
                "http.extraHeader=Authorization: Bearer {}",
                token.expose()
            ));
        }
        args.extend(
            ["fetch", "--quiet", "--depth", "1", "--", self.url.as_str(), revision]
                .iter()
                .map(|s| s.to_string()),
        );
        Ok(args)
    }
}

#[async_trait]
impl SourceProvider for GitSource {
    async fn fetch(&self, revision: &str, destination: &Path) -> Result<Artifact, FailureCause> {
        info!("Fetching {} at {}", self.url, revision);

        check_revision(revision).map_err(unavailable)?;

        tokio::fs::create_dir_all(destination)
            .await
            .map_err(|e| unavailable(format!("cannot create {}: {}", destination.display(), e)))?;

        let fetch = self.fetch_args(revision)?;

        self.git(destination, "init", &["init".to_string(), "--quiet".to_string()])
            .await?;
        self.git(destination, "fetch", &fetch).await?;
        self.git(
            destination,
            "checkout",
            &["checkout".to_string(), "--quiet".to_string(), "FETCH_HEAD".to_string()],
        )
        .await?;

        debug!("Checked out {} into {}", revision, destination.display());
        Ok(Artifact::new(
            SOURCE_OUTPUT,
            destination,
            StageName::Source,
            revision,
        ))
    }
}

// =============================================================================
// Static
// =============================================================================

/// Writes a fixed file tree for every revision
///
/// Used for local runs and tests where no repository is reachable.
#[derive(Debug, Default)]
pub struct StaticSource {
    files: BTreeMap<String, String>,
    /// When set, every fetch fails with this message
    unavailable: Option<String>,
    fetched: Mutex<Vec<String>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file, relative to the checkout root
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    /// A source that cannot be reached
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            unavailable: Some(message.into()),
            ..Default::default()
        }
    }

    /// Revisions fetched so far, in order
    pub fn fetched(&self) -> Vec<String> {
        self.fetched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SourceProvider for StaticSource {
    async fn fetch(&self, revision: &str, destination: &Path) -> Result<Artifact, FailureCause> {
        if let Some(message) = &self.unavailable {
            return Err(unavailable(message.clone()));
        }

        for (path, content) in &self.files {
            let target = destination.join(path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| unavailable(e.to_string()))?;
            }
            tokio::fs::write(&target, content)
                .await
                .map_err(|e| unavailable(e.to_string()))?;
        }
        tokio::fs::create_dir_all(destination)
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        self.fetched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(revision.to_string());

        Ok(Artifact::new(
            SOURCE_OUTPUT,
            destination,
            StageName::Source,
            revision,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_core::domain::secret::SecretValue;

    struct NoSecrets;

    impl SecretResolver for NoSecrets {
        fn resolve(&self, reference: &SecretKeyRef) -> Result<SecretValue, FailureCause> {
            Err(FailureCause::Provisioning {
                message: format!("unknown secret {}", reference.secret),
            })
        }
    }

    #[tokio::test]
    async fn test_static_source_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = StaticSource::new().with_file("buildspec.yml", "version: 0.2\n");

        let artifact = source.fetch("abc123", dir.path()).await.unwrap();

        assert_eq!(artifact.qualified_name(), "Source/SourceOutput");
        assert_eq!(artifact.revision(), "abc123");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("buildspec.yml")).unwrap(),
            "version: 0.2\n"
        );
        assert_eq!(source.fetched(), vec!["abc123"]);
    }

    #[tokio::test]
    async fn test_unavailable_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = StaticSource::unavailable("repository not found");

        let err = source.fetch("abc123", dir.path()).await.unwrap_err();
        assert_eq!(err.label(), "SourceUnavailable");
        assert!(source.fetched().is_empty());
    }

    #[tokio::test]
    async fn test_git_source_unresolvable_token() {
        let dir = tempfile::tempdir().unwrap();
        let source = GitSource::new(
            "https://example.invalid/repo.git",
            SecretKeyRef::parse("github-token:value"),
            Arc::new(NoSecrets),
        );

        match source.fetch("abc123", dir.path()).await.unwrap_err() {
            FailureCause::SourceUnavailable { message } => {
                assert!(message.contains("github-token:value"));
            }
            other => panic!("unexpected cause: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_git_source_unreachable_repository() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let source = GitSource::new(missing.to_string_lossy(), None, Arc::new(NoSecrets));

        let err = source
            .fetch("abc123", &dir.path().join("checkout"))
            .await
            .unwrap_err();
        assert_eq!(err.label(), "SourceUnavailable");
    }

    #[test]
    fn test_fetch_args_end_options_before_url() {
        let source = GitSource::new("https://example.invalid/repo.git", None, Arc::new(NoSecrets));

        let args = source.fetch_args("abc123").unwrap();
        assert_eq!(
            args,
            vec!["fetch", "--quiet", "--depth", "1", "--", "https://example.invalid/repo.git", "abc123"]
        );
    }

    #[tokio::test]
    async fn test_git_source_rejects_option_like_revision() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("pwned");
        let source = GitSource::new(dir.path().to_string_lossy(), None, Arc::new(NoSecrets));

        let err = source
            .fetch(
                &format!("--upload-pack=touch {}; git-upload-pack", marker.display()),
                &dir.path().join("checkout"),
            )
            .await
            .unwrap_err();

        assert_eq!(err.label(), "SourceUnavailable");
        assert!(!marker.exists());
        assert!(!dir.path().join("checkout").exists());
    }
}
