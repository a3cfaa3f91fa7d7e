//! Build worker: runs one job end to end.
//!
//! Manages the deploy subprocess, streams its output into the build log, and
//! drives the build state machine to exactly one terminal state. A failing
//! build is a normal outcome here, not an error — nothing propagates past
//! `run_job`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use caravel_core::db::DatabaseError;
use caravel_crypto::EnvVar;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::githost::{GitHostClient, authenticated_clone_url};
use crate::kms::KeyService;
use crate::sites::SiteDirectory;
use crate::storage::{BuildStatus, Database};

use super::script::{ScriptSpec, build_script};
use super::{BuildError, BuildJob, RepoSpec};

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base directory for ephemeral checkouts.
    pub workdir: PathBuf,
    /// Upload CLI binary name.
    pub upload_bin: String,
    /// Wall-clock cap for the deploy subprocess.
    pub build_timeout: Duration,
}

#[derive(Debug)]
pub(crate) struct ScriptOutcome {
    pub success: bool,
    pub code: Option<i32>,
    /// Last non-empty output line, kept for the structured result payload
    /// some build tools print on their final line.
    pub last_line: Option<String>,
}

/// Runs build jobs against the database and external collaborators.
pub struct BuildWorker {
    db: Database,
    kms: Arc<dyn KeyService>,
    /// Needed only for webhook builds; web deploys never touch the git host.
    githost: Option<Arc<GitHostClient>>,
    /// When present, successful deploys patch the site record.
    sites: Option<Arc<dyn SiteDirectory>>,
    config: WorkerConfig,
}

impl BuildWorker {
    pub fn new(
        db: Database,
        kms: Arc<dyn KeyService>,
        githost: Option<Arc<GitHostClient>>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            db,
            kms,
            githost,
            sites: None,
            config,
        }
    }

    #[must_use]
    pub fn with_site_directory(mut self, sites: Arc<dyn SiteDirectory>) -> Self {
        self.sites = Some(sites);
        self
    }

    /// Run one job to completion. Redelivered jobs for already-finished
    /// builds are skipped, and a failing build is a normal outcome that
    /// still returns `Ok`. An `Err` means the job never started because the
    /// database was unavailable; the caller should release it for
    /// redelivery.
    #[instrument(skip_all, fields(build_id = %job.build_id))]
    pub async fn run_job(&self, job: &BuildJob) -> Result<(), DatabaseError> {
        let build = match self.db.get_build(&job.build_id).await {
            Ok(build) => build,
            Err(DatabaseError::NotFound(_)) => {
                warn!("Dropping job for unknown build");
                return Ok(());
            }
            Err(err) => {
                error!(error = %err, "Could not load build, leaving job for redelivery");
                return Err(err);
            }
        };
        if BuildStatus::parse(&build.build_status).is_some_and(|s| s.is_terminal()) {
            debug!("Skipping redelivered job for finished build");
            return Ok(());
        }

        match self.db.start_build(&job.build_id).await {
            Ok(true) => {}
            Ok(false) => {
                // Already in progress: a worker died mid-build and the queue
                // redelivered. Run it again; the terminal guard keeps the
                // outcome single.
                debug!("Build already marked in progress, re-running");
            }
            Err(err) => {
                error!(error = %err, "Could not mark build in progress, leaving job for redelivery");
                return Err(err);
            }
        }

        if let Err(err) = self.execute(job).await {
            let reason = err.to_string();
            error!(error = %err, "Build pipeline error");
            if let Err(log_err) = self.db.append_build_log(&job.build_id, &reason, None).await {
                warn!(error = %log_err, "Failed to append failure log line");
            }
            match self
                .db
                .finish_build(&job.build_id, BuildStatus::Failed, Some(&reason))
                .await
            {
                Ok(true) => {}
                Ok(false) => debug!("Build was already finalized"),
                Err(db_err) => error!(error = %db_err, "Failed to finalize build"),
            }
        }
        Ok(())
    }

    async fn execute(&self, job: &BuildJob) -> Result<(), BuildError> {
        let envs = self.prepare_env(job).await?;

        let run_dir = self.config.workdir.join(format!("build-{}", job.build_id));
        tokio::fs::create_dir_all(&run_dir).await?;

        let script = build_script(&ScriptSpec {
            workdir: &run_dir,
            prebuilt_dir: job.prebuilt_dir.as_deref(),
            branch: job.repo.as_ref().map_or("main", |r| r.branch.as_str()),
            install_command: job.install_command.as_deref(),
            build_command: job.build_command.as_deref(),
            output_dir: &job.output_dir,
            site_id: &job.site_id,
            upload_bin: &self.config.upload_bin,
        });

        let outcome = self.run_script(&job.build_id, &script, &envs).await;
        tokio::fs::remove_dir_all(&run_dir).await.ok();
        let outcome = outcome?;

        if outcome.success {
            if let Some(last) = &outcome.last_line {
                // Build tools may print a structured payload as their final
                // line; anything unparseable is fine.
                match serde_json::from_str::<serde_json::Value>(last) {
                    Ok(payload) => debug!(%payload, "Structured build result"),
                    Err(_) => debug!("Final output line is not structured"),
                }
            }
            if self
                .db
                .finish_build(&job.build_id, BuildStatus::Success, None)
                .await?
            {
                info!("Build succeeded");
                self.record_deploy(job).await;
            }
        } else {
            let reason = outcome.code.map_or_else(
                || "Build script terminated by signal".to_string(),
                |code| format!("Build script exited with status {code}"),
            );
            if self
                .db
                .finish_build(&job.build_id, BuildStatus::Failed, Some(&reason))
                .await?
            {
                info!(%reason, "Build failed");
            }
        }
        Ok(())
    }

    /// Patch the site record with the deploy outcome. Best-effort: the build
    /// already succeeded, so a directory failure is only logged.
    async fn record_deploy(&self, job: &BuildJob) {
        let Some(sites) = &self.sites else { return };
        let patch = serde_json::json!({
            "last_build_id": job.build_id,
            "last_deployed_at": caravel_core::unix_timestamp(),
        });
        if let Err(err) = sites.update_website(&job.site_id, &patch).await {
            warn!(error = %err, "Failed to record deploy on site record");
        }
    }

    /// Assemble the subprocess environment. All secret material is decrypted
    /// here, handed to the child through its environment, and dropped with
    /// the map when the run ends.
    async fn prepare_env(&self, job: &BuildJob) -> Result<HashMap<String, String>, BuildError> {
        let mut envs = HashMap::new();

        let hosting_secret = self
            .kms
            .decrypt(&job.hosting_secret_enc, &job.kms_key_id)
            .await?;
        envs.insert("HOSTING_KEY".to_string(), job.hosting_key.clone());
        envs.insert("HOSTING_SECRET".to_string(), hosting_secret);

        if let Some(bundle_enc) = &job.env_vars_enc {
            let bundle = self.kms.decrypt(bundle_enc, &job.kms_key_id).await?;
            let vars: Vec<EnvVar> = serde_json::from_str(&bundle)?;
            for var in vars {
                envs.insert(var.key, var.value);
            }
        }

        if let Some(repo) = &job.repo {
            envs.insert("CARAVEL_CLONE_URL".to_string(), self.clone_url(repo).await?);
        }

        Ok(envs)
    }

    /// Resolve clone credentials, refreshing the access token first when a
    /// refresh token is on file so the clone runs with a fresh one.
    async fn clone_url(&self, repo: &RepoSpec) -> Result<String, BuildError> {
        let cred = self.db.get_credential(&repo.project_id).await?;

        let access_token = match (&self.githost, &cred.refresh_token) {
            (Some(host), Some(refresh)) => {
                let tokens = host.refresh_token(refresh).await?;
                self.db
                    .rotate_tokens(
                        &repo.project_id,
                        &tokens.access_token,
                        tokens.refresh_token.as_deref(),
                    )
                    .await?;
                tokens.access_token
            }
            (None, Some(_)) => {
                return Err(BuildError::Credentials(
                    "Refresh token on file but no git host is configured".into(),
                ));
            }
            (_, None) => cred.access_token.clone(),
        };

        Ok(authenticated_clone_url(&repo.url, &cred.username, &access_token)?)
    }

    /// Spawn the deploy script and stream every output line into the build
    /// log as it arrives, bounded by the configured timeout.
    pub(crate) async fn run_script(
        &self,
        build_id: &str,
        script: &str,
        envs: &HashMap<String, String>,
    ) -> Result<ScriptOutcome, BuildError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .envs(envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("Failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("Failed to capture stderr"))?;

        let (tx, mut rx) = mpsc::channel::<String>(64);
        let err_tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if err_tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        let timeout_secs = self.config.build_timeout.as_secs();
        let mut last_line: Option<String> = None;

        let waited = tokio::time::timeout(self.config.build_timeout, async {
            while let Some(line) = rx.recv().await {
                let last = (!line.trim().is_empty()).then_some(line.as_str());
                if let Err(err) = self.db.append_build_log(build_id, &line, last).await {
                    warn!(error = %err, "Failed to append build log line");
                }
                if !line.trim().is_empty() {
                    last_line = Some(line);
                }
            }
            child.wait().await
        })
        .await;

        match waited {
            Ok(Ok(status)) => Ok(ScriptOutcome {
                success: status.success(),
                code: status.code(),
                last_line,
            }),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                child.kill().await.ok();
                Err(BuildError::TimedOut(timeout_secs))
            }
        }
    }
}

/// Poll loop for one queue worker. Claims jobs until the queue is empty,
/// then sleeps for the poll interval; exits when `shutdown` flips.
pub async fn run_worker_loop(
    db: Database,
    worker: Arc<BuildWorker>,
    worker_id: String,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(%worker_id, "Build worker started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            () = tokio::time::sleep(poll_interval) => {}
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            match db.claim_next_job(&worker_id).await {
                Ok(Some(row)) => {
                    let consumed = match serde_json::from_str::<BuildJob>(&row.payload) {
                        Ok(job) => match worker.run_job(&job).await {
                            Ok(()) => true,
                            Err(err) => {
                                warn!(job_id = row.id, error = %err, "Job did not start, releasing for redelivery");
                                false
                            }
                        },
                        Err(err) => {
                            warn!(job_id = row.id, error = %err, "Discarding malformed job payload");
                            true
                        }
                    };
                    if consumed {
                        if let Err(err) = db.complete_job(row.id).await {
                            warn!(job_id = row.id, error = %err, "Failed to mark job done");
                        }
                    } else if let Err(err) = db.release_job(row.id).await {
                        warn!(job_id = row.id, error = %err, "Failed to release job");
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "Queue claim failed");
                    break;
                }
            }
        }

        if *shutdown.borrow() {
            break;
        }
    }
    info!(%worker_id, "Build worker stopped");
}
