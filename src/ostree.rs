//! OS image manager client.
//!
//! The image manager is an opaque `ostree` subprocess: status is parsed
//! from its fixed text report, content is pulled and deployed through it,
//! and remotes are configured by dropping a conf file into its remotes
//! directory. Completion of a deployment is only observed after reboot,
//! via a fresh status query.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::util::cmd::{CmdError, Runner};
use crate::util::fs::safe_write_all;

const REMOTES_DIR: &str = "/etc/ostree/remotes.d";

#[derive(Debug, Error)]
pub enum OsTreeError {
    #[error(transparent)]
    Cmd(#[from] CmdError),

    #[error("unable to parse image status report: {0}")]
    BadStatus(String),

    #[error("unable to write remote config {}: {source}", .path.display())]
    RemoteConfig {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Live deployment state, derived from the image manager on every query
/// and never persisted by this layer.
#[derive(Debug, Clone, PartialEq)]
pub struct OsStatus {
    /// Hash of the image the device is currently running.
    pub active: String,
    /// Hash of a staged next-boot image, if any.
    pub pending: Option<String>,
}

/// Client for the `ostree` image manager subprocess.
pub struct ImageManager {
    runner: Arc<dyn Runner>,
    remotes_dir: PathBuf,
}

impl ImageManager {
    pub fn new(runner: Arc<dyn Runner>) -> Self {
        Self {
            runner,
            remotes_dir: PathBuf::from(REMOTES_DIR),
        }
    }

    /// Override the remotes directory, e.g. for a mounted sysroot.
    pub fn with_remotes_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.remotes_dir = dir.into();
        self
    }

    /// Query the live deployment status.
    pub async fn status(&self) -> Result<OsStatus, OsTreeError> {
        let report = self
            .runner
            .output(None, &["ostree", "admin", "status"], &[])
            .await?;
        parse_status(&report)
    }

    /// Configure a named remote to pull from. GPG verification is usually
    /// disabled here: content authenticity is enforced by hash, upstream
    /// of this call.
    pub fn add_remote(&self, label: &str, url: &str, ignore_gpg: bool) -> Result<(), OsTreeError> {
        let path = self.remotes_dir.join(format!("{label}.conf"));
        let mut conf = format!("[remote \"{label}\"]\nurl={url}\n");
        if ignore_gpg {
            conf.push_str("gpg-verify=false\n");
        }
        safe_write_all(&path, conf).map_err(|source| OsTreeError::RemoteConfig { path, source })
    }

    /// Pull the addressed commit and stage it as the next-boot deployment.
    pub async fn pull_and_deploy(&self, remote: &str, hash: &str) -> Result<(), OsTreeError> {
        info!("pulling ostree objects for {remote}:{hash}");
        self.runner
            .stream(None, &["ostree", "pull", remote, hash], &[])
            .await?;

        info!("deploying ostree image {remote}:{hash}");
        self.runner
            .stream(None, &["ostree", "admin", "deploy", hash], &[])
            .await?;
        Ok(())
    }
}

/// Parse the fixed-format status report. A `*`-prefixed row marks the
/// active image, a `(pending)`-suffixed row the pending one; each hash is
/// the text before the first `.` in its row's hash field.
fn parse_status(report: &str) -> Result<OsStatus, OsTreeError> {
    let mut active = None;
    let mut pending = None;

    for line in report.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() > 2 && fields[0] == "*" {
            active = Some(hash_field(fields[2])?);
        } else if fields.len() == 3 && fields[2] == "(pending)" {
            pending = Some(hash_field(fields[1])?);
        }
    }

    let active =
        active.ok_or_else(|| OsTreeError::BadStatus("no active deployment marked".to_owned()))?;
    Ok(OsStatus { active, pending })
}

fn hash_field(field: &str) -> Result<String, OsTreeError> {
    match field.find('.') {
        Some(idx) => Ok(field[..idx].to_owned()),
        None => Err(OsTreeError::BadStatus(format!(
            "malformed hash field '{field}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::cmd::testing::FakeRunner;

    #[tokio::test]
    async fn status_parses_active_row() {
        let report = "\
* lmp 435b6162c6240ac995421d0417ebfa79cf0f6081d34f9d995a2431a695ded52b.15
    origin refspec: 435b6162c6240ac995421d0417ebfa79cf0f6081d34f9d995a2431a695ded52b
  lmp f315bbe0cde9125f91ca3faee238df121fbb0ad20499b11148402ee7f0fb1859.0 (rollback)
    origin refspec: f315bbe0cde9125f91ca3faee238df121fbb0ad20499b11148402ee7f0fb1859
";
        let runner = Arc::new(FakeRunner::new().with_output("ostree", report));
        let images = ImageManager::new(runner.clone());

        let status = images.status().await.unwrap();
        assert_eq!(
            status.active,
            "435b6162c6240ac995421d0417ebfa79cf0f6081d34f9d995a2431a695ded52b"
        );
        assert_eq!(status.pending, None);
        assert_eq!(runner.lines(), vec!["ostree admin status"]);
    }

    #[tokio::test]
    async fn status_parses_pending_row() {
        let report = "\
  lmp 435b6162c6240ac995421d0417ebfa79cf0f6081d34f9d995a2431a695ded52b.0 (pending)
    origin refspec: 435b6162c6240ac995421d0417ebfa79cf0f6081d34f9d995a2431a695ded52b
*  lmp f315bbe0cde9125f91ca3faee238df121fbb0ad20499b11148402ee7f0fb1859.0
    origin refspec: f315bbe0cde9125f91ca3faee238df121fbb0ad20499b11148402ee7f0fb1859
";
        let runner = Arc::new(FakeRunner::new().with_output("ostree", report));
        let images = ImageManager::new(runner);

        let status = images.status().await.unwrap();
        assert_eq!(
            status.active,
            "f315bbe0cde9125f91ca3faee238df121fbb0ad20499b11148402ee7f0fb1859"
        );
        assert_eq!(
            status.pending.as_deref(),
            Some("435b6162c6240ac995421d0417ebfa79cf0f6081d34f9d995a2431a695ded52b")
        );
    }

    #[tokio::test]
    async fn status_rejects_report_without_active_row() {
        let runner = Arc::new(FakeRunner::new().with_output("ostree", "nothing here\n"));
        let images = ImageManager::new(runner);

        assert!(matches!(
            images.status().await,
            Err(OsTreeError::BadStatus(_))
        ));
    }

    #[test]
    fn add_remote_writes_conf() {
        let dir = tempfile::tempdir().unwrap();
        let images =
            ImageManager::new(Arc::new(FakeRunner::new())).with_remotes_dir(dir.path());

        images
            .add_remote("catalog", "https://treehub.example.com", true)
            .unwrap();

        let conf = std::fs::read_to_string(dir.path().join("catalog.conf")).unwrap();
        assert_eq!(
            conf,
            "[remote \"catalog\"]\nurl=https://treehub.example.com\ngpg-verify=false\n"
        );
    }

    #[tokio::test]
    async fn pull_and_deploy_invokes_both_steps() {
        let runner = Arc::new(FakeRunner::new());
        let images = ImageManager::new(runner.clone());

        images.pull_and_deploy("catalog", "abc123").await.unwrap();

        assert_eq!(
            runner.lines(),
            vec![
                "ostree pull catalog abc123",
                "ostree admin deploy abc123",
            ]
        );
    }
}
