//! Trigger, work item and firing-log records read and written by the
//! scheduler.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub type TriggerId = String;
pub type WorkItemId = String;

/// How a trigger is activated. Only `Cron` triggers are evaluated by the
/// scheduler; the others are fired by the dashboard or inbound webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Cron,
    Webhook,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Webhook => "webhook",
            Self::Manual => "manual",
        }
    }

    pub fn from_str_value(s: &str) -> Self {
        match s {
            "cron" => Self::Cron,
            "webhook" => Self::Webhook,
            _ => Self::Manual,
        }
    }
}

/// A persisted trigger definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: TriggerId,
    /// Agent that receives (and is recorded as creating) the work items.
    pub agent_id: String,
    /// Tenant the work items are scoped to.
    pub workspace_id: String,
    pub trigger_type: TriggerType,
    pub cron_expression: Option<String>,
    pub task_title_template: String,
    pub task_description_template: String,
    pub enabled: bool,
    /// Last successful firing. Only the scheduler writes this, and never
    /// moves it backwards.
    pub last_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Trigger {
    /// Create an enabled cron trigger.
    pub fn cron(
        agent_id: &str,
        workspace_id: &str,
        expression: &str,
        title_template: &str,
        description_template: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            workspace_id: workspace_id.to_string(),
            trigger_type: TriggerType::Cron,
            cron_expression: Some(expression.to_string()),
            task_title_template: title_template.to_string(),
            task_description_template: description_template.to_string(),
            enabled: true,
            last_fired_at: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the scheduler should look at this trigger at all.
    pub fn is_candidate(&self) -> bool {
        self.enabled && self.trigger_type == TriggerType::Cron && self.cron_expression.is_some()
    }
}

/// Work item lifecycle. The scheduler only ever creates `Pending` items;
/// the execution engine moves them on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str_value(s: &str) -> Self {
        match s {
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn from_str_value(s: &str) -> Self {
        match s {
            "low" => Self::Low,
            "high" => Self::High,
            _ => Self::Medium,
        }
    }
}

/// A work item about to be inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub workspace_id: String,
    pub title: String,
    pub description: String,
    pub assignee_agent_id: String,
    /// Triggered items are self-created by the assigned agent.
    pub creator_agent_id: String,
    pub trigger_id: TriggerId,
    /// Idempotency key, unique per trigger and matched minute.
    pub fire_key: String,
    pub status: WorkItemStatus,
    pub priority: Priority,
    pub scheduled_at: DateTime<Utc>,
}

impl NewWorkItem {
    /// Build the work item a trigger produces at `now`.
    pub fn from_trigger<Tz: TimeZone>(
        trigger: &Trigger,
        title: String,
        description: String,
        now: &DateTime<Tz>,
    ) -> Self {
        Self {
            workspace_id: trigger.workspace_id.clone(),
            title,
            description,
            assignee_agent_id: trigger.agent_id.clone(),
            creator_agent_id: trigger.agent_id.clone(),
            trigger_id: trigger.id.clone(),
            fire_key: fire_key(&trigger.id, now),
            status: WorkItemStatus::Pending,
            priority: Priority::Medium,
            scheduled_at: now.with_timezone(&Utc),
        }
    }
}

/// A stored work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub workspace_id: String,
    pub title: String,
    pub description: String,
    pub assignee_agent_id: String,
    pub creator_agent_id: String,
    pub trigger_id: Option<TriggerId>,
    pub fire_key: Option<String>,
    pub status: WorkItemStatus,
    pub priority: Priority,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn from_new(id: WorkItemId, item: &NewWorkItem) -> Self {
        Self {
            id,
            workspace_id: item.workspace_id.clone(),
            title: item.title.clone(),
            description: item.description.clone(),
            assignee_agent_id: item.assignee_agent_id.clone(),
            creator_agent_id: item.creator_agent_id.clone(),
            trigger_id: Some(item.trigger_id.clone()),
            fire_key: Some(item.fire_key.clone()),
            status: item.status,
            priority: item.priority,
            scheduled_at: item.scheduled_at,
            created_at: Utc::now(),
        }
    }
}

/// Idempotency key: trigger id plus the matched minute in UTC.
pub fn fire_key<Tz: TimeZone>(trigger_id: &str, now: &DateTime<Tz>) -> String {
    format!(
        "{}@{}",
        trigger_id,
        now.with_timezone(&Utc).format("%Y-%m-%dT%H:%M")
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FiringStatus {
    Fired,
    Failed,
}

impl FiringStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fired => "fired",
            Self::Failed => "failed",
        }
    }

    pub fn from_str_value(s: &str) -> Self {
        match s {
            "fired" => Self::Fired,
            _ => Self::Failed,
        }
    }
}

/// One append-only record per due evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiringLogEntry {
    pub id: String,
    pub trigger_id: TriggerId,
    pub work_item_id: Option<WorkItemId>,
    pub status: FiringStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FiringLogEntry {
    pub fn fired(trigger_id: &str, work_item_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            trigger_id: trigger_id.to_string(),
            work_item_id: Some(work_item_id.to_string()),
            status: FiringStatus::Fired,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn failed(trigger_id: &str, error: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            trigger_id: trigger_id.to_string(),
            work_item_id: None,
            status: FiringStatus::Failed,
            error: Some(error.to_string()),
            created_at: Utc::now(),
        }
    }
}
