//! Wire types for the code-hosting REST API (spec §3 "Data model").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct WorkItem {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub labels: Vec<Label>,
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
}

impl WorkItem {
    pub fn label_names(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|l| l.name.as_str())
    }

    pub fn has_label(&self, name: &str) -> bool {
        self.label_names().any(|l| l == name)
    }

    /// True iff this issue is actually a change-set (spec §3: a work item
    /// "is not itself a change-set").
    pub fn is_change_set(&self) -> bool {
        self.pull_request.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mergeability {
    Clean,
    Dirty,
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeSet {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub head: ChangeSetRef,
    pub base: ChangeSetRef,
    #[serde(default)]
    pub mergeable: Option<bool>,
    #[serde(default = "default_mergeability")]
    pub mergeable_state: Mergeability,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: Vec<Label>,
}

fn default_mergeability() -> Mergeability {
    Mergeability::Unknown
}

impl ChangeSet {
    pub fn source_branch(&self) -> &str {
        &self.head.reference
    }

    pub fn head_sha(&self) -> &str {
        &self.head.sha
    }

    pub fn is_owned(&self, branch_prefix: &str) -> bool {
        self.source_branch().starts_with(branch_prefix)
    }

    pub fn is_dirty(&self) -> bool {
        self.mergeable_state == Mergeability::Dirty || self.mergeable == Some(false)
    }

    pub fn age_days(&self) -> i64 {
        (Utc::now() - self.updated_at).num_days()
    }

    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.name == name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeSetRef {
    #[serde(rename = "ref")]
    pub reference: String,
    pub sha: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckRun {
    pub name: String,
    #[serde(default)]
    pub conclusion: Option<String>,
}

impl CheckRun {
    pub fn failed(&self) -> bool {
        self.conclusion.as_deref() == Some("failure")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateChangeSetRequest<'a> {
    pub title: &'a str,
    pub head: &'a str,
    pub base: &'a str,
    pub body: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct PostCommentRequest<'a> {
    pub body: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatchCommentRequest<'a> {
    pub body: &'a str,
}
