use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::RouteId;
use super::route::Route;

/// Ordered stages of the per-route pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskName {
    HtmlInspect,
    LinkExtract,
    AuditExecute,
    Finalize,
}

impl TaskName {
    pub const CHAIN: [TaskName; 4] = [
        TaskName::HtmlInspect,
        TaskName::LinkExtract,
        TaskName::AuditExecute,
        TaskName::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskName::HtmlInspect => "html-inspect",
            TaskName::LinkExtract => "link-extract",
            TaskName::AuditExecute => "audit-execute",
            TaskName::Finalize => "finalize",
        }
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Complete,
    Failed,
}

impl TaskStatus {
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Queued => 0,
            TaskStatus::Running => 1,
            TaskStatus::Complete | TaskStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// States only move forward; a rescan reset is the sole way back.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    fn queued() -> Self {
        Self {
            status: TaskStatus::Queued,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Page metadata pulled out of the inspected HTML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeoMeta {
    pub title: Option<String>,
    pub description: Option<String>,
    pub favicon: Option<String>,
    pub og_image: Option<String>,
    pub internal_links: usize,
    pub external_links: usize,
}

/// Cache keys of the artifacts produced for a route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Category scores in `[0, 1]` as reported by the audit engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub overall: Option<f64>,
    pub categories: BTreeMap<String, f64>,
}

impl ScoreSummary {
    pub fn from_categories(categories: BTreeMap<String, f64>) -> Self {
        let overall = if categories.is_empty() {
            None
        } else {
            Some(categories.values().sum::<f64>() / categories.len() as f64)
        };
        Self {
            overall,
            categories,
        }
    }

    pub fn category(&self, name: &str) -> Option<f64> {
        self.categories.get(name).copied()
    }
}

/// Aggregate of one route's pipeline state and artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteReport {
    pub route: Route,
    pub tasks: BTreeMap<TaskName, TaskState>,
    pub artifacts: ArtifactRefs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seo: Option<SeoMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<ScoreSummary>,
    pub from_cache: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audited_at: Option<DateTime<Utc>>,
}

impl RouteReport {
    pub fn new(route: Route) -> Self {
        let now = Utc::now();
        Self {
            route,
            tasks: BTreeMap::new(),
            artifacts: ArtifactRefs::default(),
            seo: None,
            score: None,
            from_cache: false,
            created_at: now,
            updated_at: now,
            audited_at: None,
        }
    }

    pub fn id(&self) -> &RouteId {
        &self.route.id
    }

    pub fn task_status(&self, task: TaskName) -> Option<TaskStatus> {
        self.tasks.get(&task).map(|state| state.status)
    }

    /// Applies a forward transition. Returns false (and changes nothing) when
    /// the transition would move the task backwards.
    pub fn transition(&mut self, task: TaskName, next: TaskStatus, error: Option<String>) -> bool {
        let state = self.tasks.entry(task).or_insert_with(TaskState::queued);
        if !state.status.can_transition_to(next) {
            return false;
        }
        state.status = next;
        if next == TaskStatus::Running {
            state.attempts = state.attempts.max(1);
        }
        if error.is_some() {
            state.last_error = error;
        }
        state.updated_at = Utc::now();
        self.updated_at = state.updated_at;
        true
    }

    /// Records a further attempt of a running task without changing state,
    /// so retries stay invisible to observers.
    pub fn record_attempt(&mut self, task: TaskName, error: Option<String>) {
        if let Some(state) = self.tasks.get_mut(&task)
            && state.status == TaskStatus::Running
        {
            state.attempts += 1;
            if error.is_some() {
                state.last_error = error;
            }
            state.updated_at = Utc::now();
        }
    }

    /// Explicit rescan reset: every known task goes back to queued.
    pub fn reset_for_rescan(&mut self) {
        let now = Utc::now();
        for state in self.tasks.values_mut() {
            state.status = TaskStatus::Queued;
            state.attempts = 0;
            state.last_error = None;
            state.updated_at = now;
        }
        self.from_cache = false;
        self.updated_at = now;
    }

    pub fn has_failed(&self) -> bool {
        self.tasks
            .values()
            .any(|state| state.status == TaskStatus::Failed)
    }

    pub fn is_complete(&self) -> bool {
        self.task_status(TaskName::Finalize) == Some(TaskStatus::Complete)
    }

    /// True once the route can no longer make progress without a rescan.
    pub fn is_terminal(&self) -> bool {
        self.has_failed() || self.is_complete()
    }

    pub fn category_score(&self, category: &str) -> Option<f64> {
        if !self.is_complete() {
            return None;
        }
        self.score.as_ref().and_then(|score| score.category(category))
    }
}
