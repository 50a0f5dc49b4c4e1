//! Claim Protocol (spec §4.5) — the atomic, comment-based acquisition of
//! work items and owned change-sets that lets an arbitrary number of
//! worker processes cooperate without a shared database.

use crate::error::{ClaimError, HostApiError};
use crate::host_api::types::{Comment, WorkItem};
use crate::host_api::HostApiClient;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CLAIM_VERIFICATION_DELAY: Duration = Duration::from_secs(3);
pub const CLAIM_TIMEOUT: Duration = Duration::from_secs(120);

const WORK_ITEM_CLAIM_PREFIX: &str = "CLAIM:";
const CHANGE_SET_CLAIM_PREFIX: &str = "PR-CLAIM:";
const IN_PROGRESS_LABEL: &str = "in-progress";

pub struct ClaimProtocol {
    worker_id: String,
}

impl ClaimProtocol {
    pub fn new(worker_id: String) -> Self {
        Self { worker_id }
    }

    /// Phase 3 of the scheduler: find a work item that *looks* available.
    /// Does not claim it — claiming happens in `claim_work_item` so a
    /// failed claim attempt doesn't block the caller from trying the next
    /// candidate in a future loop.
    pub async fn find_available_work_item(
        &self,
        api: &mut HostApiClient,
        trigger_label: &str,
    ) -> Result<Option<WorkItem>, HostApiError> {
        let items = api.list_open_work_items_by_label(trigger_label).await?;
        Ok(items
            .into_iter()
            .find(|item| !item.is_change_set() && !item.has_label(IN_PROGRESS_LABEL)))
    }

    /// §4.5.1: the ten-step acquisition sequence for a work item.
    pub async fn claim_work_item(
        &self,
        api: &mut HostApiClient,
        number: u64,
    ) -> Result<(), ClaimError> {
        // 1. Pre-check.
        let item = api.get_work_item(number).await?;
        if let Some(item) = &item {
            if item.has_label(IN_PROGRESS_LABEL) {
                return Err(ClaimError::AlreadyClaimed);
            }
        }

        // 2. Stake.
        let now_ms = Utc::now().timestamp_millis();
        let stake_body = format!("{WORK_ITEM_CLAIM_PREFIX}{}:{now_ms}", self.worker_id);
        let staked = api.post_comment(number, &stake_body).await?;
        let c_star = staked.id;
        debug!(worker = %self.worker_id, number, comment = c_star, "staked claim");

        // 3. Settle delay.
        tokio::time::sleep(CLAIM_VERIFICATION_DELAY).await;

        // 4. Re-check label.
        let item = api.get_work_item(number).await?;
        if let Some(item) = &item {
            if item.has_label(IN_PROGRESS_LABEL) {
                let _ = api.delete_comment(c_star).await;
                return Err(ClaimError::AlreadyClaimed);
            }
        }

        // 5-7. Gather, sanitize, order candidates.
        let survivors = self.surviving_claims(api, number, WORK_ITEM_CLAIM_PREFIX).await?;

        // 8. Resolve race.
        match survivors.first() {
            Some(winner) if winner.id == c_star => {}
            _ => {
                let _ = api.delete_comment(c_star).await;
                return Err(ClaimError::LostRace);
            }
        }

        // 9. Acquire label before editing the claim comment.
        api.add_label(number, IN_PROGRESS_LABEL).await?;

        // 10. Humanize.
        let announcement = format!("🤖 claimed by worker `{}`", self.worker_id);
        let _ = api.patch_comment(c_star, &announcement).await;

        info!(worker = %self.worker_id, number, "won claim");
        Ok(())
    }

    /// §4.5.2: same shape, applied to an owned change-set.
    pub async fn claim_change_set(
        &self,
        api: &mut HostApiClient,
        number: u64,
    ) -> Result<(), ClaimError> {
        let now_ms = Utc::now().timestamp_millis();
        let stake_body = format!("{CHANGE_SET_CLAIM_PREFIX}{}", self.worker_id);
        let staked = api.post_comment(number, &stake_body).await?;
        let c_star = staked.id;
        let _ = now_ms;

        tokio::time::sleep(CLAIM_VERIFICATION_DELAY).await;

        let survivors = self.surviving_claims(api, number, CHANGE_SET_CLAIM_PREFIX).await?;
        match survivors.first() {
            Some(winner) if winner.id == c_star => {}
            _ => {
                let _ = api.delete_comment(c_star).await;
                return Err(ClaimError::LostRace);
            }
        }

        let status = format!("🤖 maintaining (worker `{}`)", self.worker_id);
        let _ = api.patch_comment(c_star, &status).await;
        info!(worker = %self.worker_id, number, "won change-set claim");
        Ok(())
    }

    /// Steps 5-7 shared by both claim variants: list comments, drop stale
    /// and ghost candidates, sort ascending by (created_at, id) — the
    /// numeric-id tie-breaker is the redesign spec.md §9 flags as an open
    /// question this rewrite resolves (SPEC_FULL.md).
    async fn surviving_claims(
        &self,
        api: &mut HostApiClient,
        number: u64,
        prefix: &str,
    ) -> Result<Vec<Comment>, HostApiError> {
        let comments = api.list_comments(number).await?;
        let now = Utc::now();

        let mut candidates: Vec<Comment> = comments
            .into_iter()
            .filter(|c| c.body.starts_with(prefix))
            .filter(|c| {
                let age = now - c.created_at;
                age < chrono::Duration::from_std(CLAIM_TIMEOUT).unwrap()
            })
            .collect();

        let mut survivors = Vec::with_capacity(candidates.len());
        for candidate in candidates.drain(..) {
            match api.get_comment(candidate.id).await? {
                Some(refetched) => survivors.push(refetched),
                None => {
                    warn!(comment = candidate.id, "ghost claim discarded");
                }
            }
        }

        survivors.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(survivors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn comment(id: u64, body: &str, age_secs: i64) -> Comment {
        Comment {
            id,
            body: body.to_string(),
            created_at: Utc::now() - ChronoDuration::seconds(age_secs),
        }
    }

    #[test]
    fn survivors_sort_by_timestamp_then_id() {
        let mut comments = vec![
            comment(3, "CLAIM:w3:1", 2),
            comment(1, "CLAIM:w1:1", 2),
            comment(2, "CLAIM:w2:1", 2),
        ];
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        // All same age; id breaks the tie.
        assert_eq!(comments[0].id, 1);
    }

    #[test]
    fn stale_claim_is_filtered_by_age() {
        let fresh = comment(1, "CLAIM:w1:1", 5);
        let stale = comment(2, "CLAIM:w2:1", 300);
        let now = Utc::now();
        let limit = ChronoDuration::from_std(CLAIM_TIMEOUT).unwrap();
        assert!(now - fresh.created_at < limit);
        assert!(now - stale.created_at >= limit);
    }
}
