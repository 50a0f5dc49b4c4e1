//! Maintenance Engine (spec §4.6). Scans owned open change-sets,
//! classifies each into at most one bucket, and repairs the single
//! highest-precedence problem found per loop (conflicted → failing →
//! stale) to cap rate-limit exposure (spec §4.6 "Repair budget").

use crate::claim::ClaimProtocol;
use crate::error::{ClaimError, MaintenanceError, WorkspaceError};
use crate::host_api::types::ChangeSet;
use crate::host_api::HostApiClient;
use crate::identity::SessionCounters;
use crate::workspace::WorkspaceManager;
use tracing::{info, warn};

const NEEDS_HUMAN_REVIEW: &str = "needs-human-review";
const STALE_DAYS: i64 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemKind {
    Conflicted,
    Failing,
    Stale,
}

pub struct Problem {
    pub change_set: ChangeSet,
    pub kind: ProblemKind,
}

pub struct ScanResult {
    pub problems: Vec<Problem>,
    pub owned_count: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct AutoFixPolicy {
    pub conflicts: bool,
    pub go_mod: bool,
    pub precommit: bool,
}

pub struct MaintenanceEngine {
    branch_prefix: String,
    policy: AutoFixPolicy,
}

impl MaintenanceEngine {
    pub fn new(branch_prefix: String, policy: AutoFixPolicy) -> Self {
        Self { branch_prefix, policy }
    }

    /// Classifies every owned, non-excluded open change-set. Conflicted
    /// change-sets are re-fetched individually because list endpoints may
    /// return undefined mergeability (spec §4.6 "Detection").
    pub async fn scan(&self, api: &mut HostApiClient) -> Result<ScanResult, MaintenanceError> {
        let open = api.list_open_change_sets().await?;
        let owned: Vec<ChangeSet> = open
            .into_iter()
            .filter(|cs| cs.is_owned(&self.branch_prefix))
            .collect();
        let owned_count = owned.len();

        let mut problems = Vec::new();
        for summary in owned {
            if summary.has_label(NEEDS_HUMAN_REVIEW) {
                continue;
            }
            let refreshed = match api.get_change_set(summary.number).await? {
                Some(cs) => cs,
                None => continue,
            };
            if refreshed.has_label(NEEDS_HUMAN_REVIEW) {
                continue;
            }

            if refreshed.is_dirty() {
                problems.push(Problem {
                    change_set: refreshed,
                    kind: ProblemKind::Conflicted,
                });
                continue;
            }

            let checks = api.list_check_runs_for_commit(refreshed.head_sha()).await?;
            if checks.iter().any(|c| c.failed()) {
                problems.push(Problem {
                    change_set: refreshed,
                    kind: ProblemKind::Failing,
                });
                continue;
            }

            if refreshed.age_days() >= STALE_DAYS {
                problems.push(Problem {
                    change_set: refreshed,
                    kind: ProblemKind::Stale,
                });
            }
        }

        Ok(ScanResult { problems, owned_count })
    }

    /// Attempts at most one repair, in conflicted → failing → stale
    /// precedence order, skipping any bucket whose auto-fix policy is
    /// disabled so a disabled higher-precedence bucket doesn't starve a
    /// lower-precedence one that's actually enabled.
    pub async fn repair_one(
        &self,
        api: &mut HostApiClient,
        claims: &ClaimProtocol,
        workspace: &WorkspaceManager,
        token: &str,
        base_branch: &str,
        counters: &mut SessionCounters,
        problems: &[Problem],
    ) -> Result<(), MaintenanceError> {
        let Some(problem) = self.choose(problems) else {
            return Ok(());
        };

        match problem.kind {
            ProblemKind::Conflicted => {
                self.repair_conflict(api, claims, workspace, token, base_branch, counters, &problem.change_set)
                    .await
            }
            ProblemKind::Failing => {
                self.repair_known_failure(api, claims, workspace, token, base_branch, counters, &problem.change_set)
                    .await
            }
            ProblemKind::Stale => {
                self.refresh_stale(api, claims, workspace, token, base_branch, counters, &problem.change_set)
                    .await
            }
        }
    }

    /// The precedence selection shared by `repair_one` and its tests:
    /// conflicted → failing → stale, skipping any bucket whose auto-fix
    /// policy is disabled rather than stopping at the first one.
    fn choose<'a>(&self, problems: &'a [Problem]) -> Option<&'a Problem> {
        [ProblemKind::Conflicted, ProblemKind::Failing, ProblemKind::Stale]
            .into_iter()
            .filter(|kind| self.policy_allows(*kind))
            .find_map(|kind| problems.iter().find(|p| p.kind == kind))
    }

    fn policy_allows(&self, kind: ProblemKind) -> bool {
        match kind {
            ProblemKind::Conflicted => self.policy.conflicts,
            ProblemKind::Failing => self.policy.go_mod || self.policy.precommit,
            ProblemKind::Stale => true,
        }
    }

    async fn repair_conflict(
        &self,
        api: &mut HostApiClient,
        claims: &ClaimProtocol,
        workspace: &WorkspaceManager,
        token: &str,
        base_branch: &str,
        counters: &mut SessionCounters,
        cs: &ChangeSet,
    ) -> Result<(), MaintenanceError> {
        if let Err(e) = claims.claim_change_set(api, cs.number).await {
            return Self::ignore_race(e);
        }

        let result = self.try_rebase(workspace, token, base_branch, cs.source_branch());

        workspace.return_to_base().ok();
        workspace.scoped_clean().ok();

        match result {
            Ok(true) => {
                api.post_comment(
                    cs.number,
                    "rebased onto the latest base branch, preferring this change-set's side for conflicting paths",
                )
                .await?;
                counters.conflicts_resolved += 1;
                info!(change_set = cs.number, "conflict auto-resolved");
                Ok(())
            }
            Ok(false) => {
                api.add_label(cs.number, NEEDS_HUMAN_REVIEW).await?;
                api.post_comment(
                    cs.number,
                    "could not auto-resolve rebase conflicts against the base branch; needs human review",
                )
                .await?;
                warn!(change_set = cs.number, "conflict could not be auto-resolved");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn repair_known_failure(
        &self,
        api: &mut HostApiClient,
        claims: &ClaimProtocol,
        workspace: &WorkspaceManager,
        token: &str,
        base_branch: &str,
        counters: &mut SessionCounters,
        cs: &ChangeSet,
    ) -> Result<(), MaintenanceError> {
        if let Err(e) = claims.claim_change_set(api, cs.number).await {
            return Self::ignore_race(e);
        }

        workspace.scoped_clean()?;
        let git = crate::git::Git::new(workspace.root());
        git.fetch(cs.source_branch())?;
        git.checkout_reset_branch(cs.source_branch(), "FETCH_HEAD")?;

        let checks = api.list_check_runs_for_commit(cs.head_sha()).await?;
        let remedy = checks
            .iter()
            .filter(|c| c.failed())
            .find_map(|c| KnownFailure::classify(&c.name, self.policy));

        let committed = match remedy {
            Some(KnownFailure::LockfileRegen) => {
                self.apply_lockfile_remedy(workspace)?
            }
            Some(KnownFailure::PrecommitGate) => self.apply_precommit_remedy(workspace)?,
            None => {
                workspace.return_to_base().ok();
                workspace.scoped_clean().ok();
                return Err(MaintenanceError::NoKnownRemedy);
            }
        };

        if committed {
            workspace.push(cs.source_branch(), token, false)?;
            api.post_comment(cs.number, "applied an automated fix for a known failing check")
                .await?;
            counters.change_sets_repaired += 1;
            info!(change_set = cs.number, "known-failure repair applied");
        }

        workspace.return_to_base().ok();
        workspace.scoped_clean().ok();
        let _ = base_branch;
        Ok(())
    }

    fn apply_lockfile_remedy(&self, workspace: &WorkspaceManager) -> Result<bool, MaintenanceError> {
        // Regenerating the dependency lockfile is delegated to the
        // project's own tooling on PATH; we only stage and commit the
        // result (spec §4.6 "Known-failure repair").
        let status = std::process::Command::new("go")
            .args(["mod", "tidy"])
            .current_dir(workspace.root())
            .status();
        if !matches!(status, Ok(s) if s.success()) {
            return Ok(false);
        }
        if !workspace.has_uncommitted_changes()? {
            return Ok(false);
        }
        workspace.commit_all("chore: regenerate lockfile")?;
        Ok(true)
    }

    fn apply_precommit_remedy(&self, workspace: &WorkspaceManager) -> Result<bool, MaintenanceError> {
        let status = std::process::Command::new("pre-commit")
            .args(["run", "--all-files"])
            .current_dir(workspace.root())
            .status();
        let _ = status;
        if !workspace.has_uncommitted_changes()? {
            return Ok(false);
        }
        workspace.commit_all("style: apply pre-commit autofixes")?;
        Ok(true)
    }

    async fn refresh_stale(
        &self,
        api: &mut HostApiClient,
        claims: &ClaimProtocol,
        workspace: &WorkspaceManager,
        token: &str,
        base_branch: &str,
        counters: &mut SessionCounters,
        cs: &ChangeSet,
    ) -> Result<(), MaintenanceError> {
        if let Err(e) = claims.claim_change_set(api, cs.number).await {
            return Self::ignore_race(e);
        }

        let age = cs.age_days();
        let result = self.try_rebase(workspace, token, base_branch, cs.source_branch());

        workspace.return_to_base().ok();
        workspace.scoped_clean().ok();

        match result {
            Ok(true) => {
                api.post_comment(
                    cs.number,
                    &format!("rebased on latest base to bring this change-set up to date (was {age} days old)"),
                )
                .await?;
                counters.stale_refreshed += 1;
                info!(change_set = cs.number, age, "staleness refresh applied");
                Ok(())
            }
            Ok(false) => {
                api.add_label(cs.number, NEEDS_HUMAN_REVIEW).await?;
                api.post_comment(cs.number, "staleness refresh hit unresolvable conflicts; needs human review")
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn try_rebase(
        &self,
        workspace: &WorkspaceManager,
        _token: &str,
        base_branch: &str,
        source_branch: &str,
    ) -> Result<bool, WorkspaceError> {
        workspace.scoped_clean()?;
        workspace.return_to_base().ok();
        let git = crate::git::Git::new(workspace.root());
        git.fetch(source_branch)?;
        git.checkout_reset_branch(source_branch, "FETCH_HEAD")?;
        workspace.rebase_preferring_ours(base_branch)
    }

    fn ignore_race(err: ClaimError) -> Result<(), MaintenanceError> {
        match err {
            ClaimError::LostRace | ClaimError::AlreadyClaimed | ClaimError::RateLimited => Ok(()),
            other => Err(other.into()),
        }
    }
}

enum KnownFailure {
    LockfileRegen,
    PrecommitGate,
}

impl KnownFailure {
    fn classify(check_name: &str, policy: AutoFixPolicy) -> Option<Self> {
        let lower = check_name.to_lowercase();
        if policy.go_mod && (lower.contains("go-mod") || lower.contains("go_mod") || lower.contains("gomod")) {
            return Some(Self::LockfileRegen);
        }
        if policy.precommit && (lower.contains("pre-commit") || lower.contains("precommit")) {
            return Some(Self::PrecommitGate);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_go_mod_check_when_enabled() {
        let policy = AutoFixPolicy {
            conflicts: true,
            go_mod: true,
            precommit: true,
        };
        assert!(matches!(
            KnownFailure::classify("build-go-mod", policy),
            Some(KnownFailure::LockfileRegen)
        ));
    }

    #[test]
    fn classify_respects_disabled_policy() {
        let policy = AutoFixPolicy {
            conflicts: true,
            go_mod: false,
            precommit: true,
        };
        assert!(KnownFailure::classify("build-go-mod", policy).is_none());
    }

    #[test]
    fn classify_precommit_check() {
        let policy = AutoFixPolicy {
            conflicts: true,
            go_mod: true,
            precommit: true,
        };
        assert!(matches!(
            KnownFailure::classify("pre-commit", policy),
            Some(KnownFailure::PrecommitGate)
        ));
    }

    fn cs(number: u64) -> ChangeSet {
        use crate::host_api::types::{ChangeSetRef, Mergeability};
        use chrono::Utc;
        ChangeSet {
            number,
            title: "t".into(),
            body: None,
            head: ChangeSetRef { reference: "claude/x".into(), sha: "a".into() },
            base: ChangeSetRef { reference: "main".into(), sha: "b".into() },
            mergeable: Some(true),
            mergeable_state: Mergeability::Clean,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            labels: vec![],
        }
    }

    fn all_enabled() -> AutoFixPolicy {
        AutoFixPolicy { conflicts: true, go_mod: true, precommit: true }
    }

    #[test]
    fn repair_precedence_prefers_conflicted_over_failing_over_stale() {
        let problems = vec![
            Problem { change_set: cs(1), kind: ProblemKind::Stale },
            Problem { change_set: cs(2), kind: ProblemKind::Failing },
            Problem { change_set: cs(3), kind: ProblemKind::Conflicted },
        ];

        let engine = MaintenanceEngine::new("claude/".to_string(), all_enabled());
        let chosen = engine.choose(&problems).unwrap();
        assert_eq!(chosen.change_set.number, 3);
    }

    #[test]
    fn repair_falls_through_to_stale_when_conflict_policy_disabled() {
        let problems = vec![
            Problem { change_set: cs(1), kind: ProblemKind::Conflicted },
            Problem { change_set: cs(2), kind: ProblemKind::Stale },
        ];

        let policy = AutoFixPolicy { conflicts: false, go_mod: true, precommit: true };
        let engine = MaintenanceEngine::new("claude/".to_string(), policy);
        let chosen = engine.choose(&problems).expect("stale repair is always allowed");
        assert_eq!(chosen.change_set.number, 2, "disabled conflict policy must not starve the stale repair");
    }

    #[test]
    fn repair_falls_through_past_disabled_failing_policy_to_stale() {
        let problems = vec![
            Problem { change_set: cs(1), kind: ProblemKind::Failing },
            Problem { change_set: cs(2), kind: ProblemKind::Stale },
        ];

        let policy = AutoFixPolicy { conflicts: true, go_mod: false, precommit: false };
        let engine = MaintenanceEngine::new("claude/".to_string(), policy);
        let chosen = engine.choose(&problems).unwrap();
        assert_eq!(chosen.change_set.number, 2);
    }

    #[test]
    fn repair_returns_none_when_only_disabled_buckets_have_problems() {
        let problems = vec![Problem { change_set: cs(1), kind: ProblemKind::Conflicted }];
        let policy = AutoFixPolicy { conflicts: false, go_mod: true, precommit: true };
        let engine = MaintenanceEngine::new("claude/".to_string(), policy);
        assert!(engine.choose(&problems).is_none());
    }
}
