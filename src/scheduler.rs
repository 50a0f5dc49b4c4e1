//! Phase Scheduler (spec §4.7) — the worker's top-level control loop:
//! maintain → check-limit → create. Exactly one invocation is active at
//! any time; this is a single-threaded cooperative scheduler (spec §5).

use crate::claim::ClaimProtocol;
use crate::config::Config;
use crate::credential_refresher::CredentialRefresher;
use crate::error::WorkerError;
use crate::host_api::types::WorkItem;
use crate::host_api::HostApiClient;
use crate::identity::SessionCounters;
use crate::maintenance::{AutoFixPolicy, MaintenanceEngine};
use crate::signals::log_shutdown;
use crate::subprocess::{head_for_publish, SubprocessAdapter};
use crate::workspace::WorkspaceManager;
use chrono::Utc;
use rand::Rng;
use std::time::Duration;
use tracing::{info, instrument, warn};

const TRIGGER_COMPLETE_LABEL: &str = "agent-complete";
const TRIGGER_FAILED_LABEL: &str = "agent-failed";
const IN_PROGRESS_LABEL: &str = "in-progress";

pub struct PhaseScheduler {
    config: Config,
    worker_id: String,
    api: HostApiClient,
    claims: ClaimProtocol,
    maintenance: MaintenanceEngine,
    workspace: WorkspaceManager,
    subprocess: SubprocessAdapter,
    credentials: CredentialRefresher,
    counters: SessionCounters,
    task_log_dir: Option<std::path::PathBuf>,
}

enum Outcome {
    PublishedNew { change_set: u64 },
    UpdatedExisting { change_set: u64 },
    NoPublish { succeeded: bool },
}

impl PhaseScheduler {
    pub fn new(
        config: Config,
        worker_id: String,
        api: HostApiClient,
        workspace: WorkspaceManager,
        subprocess: SubprocessAdapter,
        credentials: CredentialRefresher,
        task_log_dir: Option<std::path::PathBuf>,
    ) -> Self {
        let policy = AutoFixPolicy {
            conflicts: config.auto_fix_conflicts,
            go_mod: config.auto_fix_go_mod,
            precommit: config.auto_fix_precommit,
        };
        Self {
            claims: ClaimProtocol::new(worker_id.clone()),
            maintenance: MaintenanceEngine::new(config.branch_prefix.clone(), policy),
            config,
            worker_id,
            api,
            workspace,
            subprocess,
            credentials,
            counters: SessionCounters::default(),
            task_log_dir,
        }
    }

    /// Random 0-15s startup jitter to spread first-poll load across a
    /// pool (spec §4.7).
    pub async fn startup_jitter(&self) {
        let secs = rand::thread_rng().gen_range(0..15);
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    pub async fn run(&mut self, mut shutdown: impl std::future::Future<Output = ()> + Unpin) {
        loop {
            let tick = self.tick();
            tokio::select! {
                _ = &mut shutdown => {
                    log_shutdown(&self.worker_id, &self.counters);
                    return;
                }
                result = tick => {
                    if let Err(e) = result {
                        warn!(error = %e, "loop iteration failed");
                    }
                }
            }
        }
    }

    #[instrument(skip(self), fields(worker = %self.worker_id))]
    async fn tick(&mut self) -> Result<(), WorkerError> {
        info!(counters = %self.counters.summary(), "loop iteration starting");

        if let Some(deadline) = self.api.rate_limit_deadline() {
            let now = Utc::now();
            if now < deadline {
                let remaining = (deadline - now).to_std().unwrap_or(Duration::from_secs(5 * 60));
                let sleep_for = remaining.min(Duration::from_secs(5 * 60));
                info!(?sleep_for, "rate limited, sleeping");
                tokio::time::sleep(sleep_for).await;
                return Ok(());
            }
        }

        // Phase 1: maintain.
        let scan = self.maintenance.scan(&mut self.api).await?;
        if !scan.problems.is_empty() {
            self.maintenance
                .repair_one(
                    &mut self.api,
                    &self.claims,
                    &self.workspace,
                    &self.api_token().await?,
                    &self.config.base_branch,
                    &mut self.counters,
                    &scan.problems,
                )
                .await?;
            tokio::time::sleep(jitter(Duration::from_secs(0), Duration::from_secs(5))).await;
            return Ok(());
        }

        // Phase 2: check limit.
        if scan.owned_count >= self.config.max_open_change_sets {
            tokio::time::sleep(self.config.poll_interval + jitter(Duration::ZERO, Duration::from_secs(10))).await;
            return Ok(());
        }

        // Phase 3: create.
        let item = self
            .claims
            .find_available_work_item(&mut self.api, &self.config.trigger_label)
            .await?;

        let Some(item) = item else {
            tokio::time::sleep(self.config.poll_interval + jitter(Duration::ZERO, Duration::from_secs(10))).await;
            return Ok(());
        };

        self.process(item).await;
        tokio::time::sleep(jitter(Duration::ZERO, Duration::from_secs(5))).await;
        Ok(())
    }

    async fn api_token(&mut self) -> Result<String, WorkerError> {
        Ok(self.api.current_token().await?)
    }

    #[instrument(skip(self, item), fields(number = item.number))]
    async fn process(&mut self, item: WorkItem) {
        let number = item.number;

        if let Err(e) = self.claims.claim_work_item(&mut self.api, number).await {
            info!(number, error = %e, "did not win claim");
            return;
        }

        let existing = match self.api.list_open_change_sets().await {
            Ok(list) => list,
            Err(e) => {
                warn!(number, error = %e, "failed to list open change-sets");
                self.finalize(number, Outcome::NoPublish { succeeded: false }).await;
                return;
            }
        };

        let selected = match self
            .workspace
            .select_or_create_branch(number, &existing, now_ms())
        {
            Ok(s) => s,
            Err(e) => {
                warn!(number, error = %e, "workspace branch selection failed");
                self.workspace.return_to_base().ok();
                self.workspace.scoped_clean().ok();
                self.finalize(number, Outcome::NoPublish { succeeded: false }).await;
                return;
            }
        };

        let token = match self.api_token().await {
            Ok(t) => t,
            Err(e) => {
                warn!(number, error = %e, "failed to mint installation token");
                self.finalize(number, Outcome::NoPublish { succeeded: false }).await;
                return;
            }
        };
        self.credentials.refresh(&token);

        let prompt = if selected.pre_existed {
            format!(
                "Repair and update the existing change-set on branch `{}` for issue #{number}: {}",
                selected.branch, item.title
            )
        } else {
            format!(
                "Resolve issue #{number}: {}\n\n{}",
                item.title,
                item.body.as_deref().unwrap_or("")
            )
        };

        let task_log = self
            .task_log_dir
            .as_ref()
            .map(|dir| dir.join(format!("issue-{number}.log")));

        let outcome = self
            .subprocess
            .run(&prompt, self.workspace.root(), task_log.as_deref())
            .await;

        let (subprocess_success, captured) = match outcome {
            Ok(o) => (o.success, o.captured_stdout),
            Err(e) => {
                warn!(number, error = %e, "subprocess invocation failed");
                (false, String::new())
            }
        };

        if let Ok(true) = self.workspace.has_uncommitted_changes() {
            let message = format!("Automated change for #{number}");
            let _ = self.workspace.commit_all(&message);
        }

        let commits_present = self.workspace.has_commits_beyond_base().unwrap_or(false);

        let outcome = if commits_present && subprocess_success {
            if let Some(existing_number) = selected.existing_change_set {
                if self
                    .workspace
                    .push(&selected.branch, &token, true)
                    .is_ok()
                {
                    let _ = self
                        .api
                        .post_comment(existing_number, "pushed an update from the automated worker")
                        .await;
                    Outcome::UpdatedExisting { change_set: existing_number }
                } else {
                    Outcome::NoPublish { succeeded: false }
                }
            } else {
                match self.publish_new(number, &item, &selected.branch, &token, &captured).await {
                    Ok(cs) => Outcome::PublishedNew { change_set: cs },
                    Err(e) => {
                        warn!(number, error = %e, "failed to publish new change-set");
                        Outcome::NoPublish { succeeded: false }
                    }
                }
            }
        } else {
            Outcome::NoPublish { succeeded: subprocess_success }
        };

        self.finalize(number, outcome).await;

        self.workspace.return_to_base().ok();
        self.workspace.scoped_clean().ok();
        self.counters.items_processed += 1;
    }

    async fn publish_new(
        &mut self,
        number: u64,
        item: &WorkItem,
        branch: &str,
        token: &str,
        captured: &str,
    ) -> Result<u64, WorkerError> {
        self.workspace.push(branch, token, false)?;
        let title = format!("Fix: {}", item.title);
        let body = format!(
            "## Fixes #{number}\n\n{}\n\n---\n_automated by worker `{}`_",
            head_for_publish(captured),
            self.worker_id
        );
        let change_set = self
            .api
            .create_change_set(&title, branch, &self.config.base_branch, &body)
            .await?;
        Ok(change_set.number)
    }

    /// §4.8: terminal label transitions plus a summary comment.
    async fn finalize(&mut self, number: u64, outcome: Outcome) {
        let (label, change_set) = match &outcome {
            Outcome::PublishedNew { change_set } => (TRIGGER_COMPLETE_LABEL, Some(*change_set)),
            Outcome::UpdatedExisting { change_set } => (TRIGGER_COMPLETE_LABEL, Some(*change_set)),
            Outcome::NoPublish { succeeded: true } => (TRIGGER_COMPLETE_LABEL, None),
            Outcome::NoPublish { succeeded: false } => (TRIGGER_FAILED_LABEL, None),
        };

        if let Err(e) = self.api.remove_label(number, IN_PROGRESS_LABEL).await {
            warn!(number, error = %e, "failed to remove in-progress label");
        }
        if let Err(e) = self.api.remove_label(number, &self.config.trigger_label).await {
            warn!(number, error = %e, "failed to remove trigger label");
        }
        if let Err(e) = self.api.add_label(number, label).await {
            warn!(number, error = %e, "failed to add terminal label");
        }

        let summary = match change_set {
            Some(cs) => format!("finished: opened/updated change-set #{cs}"),
            None => format!("finished with label `{label}`"),
        };
        if let Err(e) = self.api.post_comment(number, &summary).await {
            warn!(number, error = %e, "failed to post summary comment");
        }
    }
}

fn now_ms() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn jitter(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let extra = rand::thread_rng().gen_range(0..=(max - min).as_millis() as u64);
    min + Duration::from_millis(extra)
}
