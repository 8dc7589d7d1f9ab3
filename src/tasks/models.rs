use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Task priority levels. Lower numeric value is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPriority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

impl From<TaskPriority> for i16 {
    fn from(p: TaskPriority) -> i16 {
        match p {
            TaskPriority::Critical => 1,
            TaskPriority::High => 2,
            TaskPriority::Normal => 5,
            TaskPriority::Low => 8,
            TaskPriority::Background => 10,
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_status", rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
        };
        write!(f, "{s}")
    }
}

/// Reserved keys carried inside `params` (see `Task::dependencies` /
/// `Task::delay_until`). Kept private so callers never hand-parse the
/// JSON directly.
pub(crate) const DEPENDENCIES_KEY: &str = "_dependencies";
pub(crate) const DELAY_UNTIL_KEY: &str = "_delay_until";

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub task_id: Uuid,
    pub agent: String,
    pub kind: String,
    pub params: Value,
    pub priority: i16,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Typed accessor for the `_dependencies` reserved key.
    pub fn dependencies(&self) -> Vec<Uuid> {
        self.params
            .get(DEPENDENCIES_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Typed accessor for the `_delay_until` reserved key.
    pub fn delay_until(&self) -> Option<DateTime<Utc>> {
        self.params
            .get(DELAY_UNTIL_KEY)
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Parameters for `TaskQueue::enqueue`.
#[derive(Debug, Clone, Default)]
pub struct EnqueueRequest {
    pub agent: String,
    pub kind: String,
    pub params: Value,
    pub priority: i16,
    pub max_retries: i32,
    pub delay_seconds: u64,
    pub depends_on: Vec<Uuid>,
}

impl EnqueueRequest {
    pub fn new(agent: impl Into<String>, kind: impl Into<String>, params: Value) -> Self {
        Self {
            agent: agent.into(),
            kind: kind.into(),
            params,
            priority: TaskPriority::Normal.into(),
            max_retries: 3,
            delay_seconds: 0,
            depends_on: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: impl Into<i16>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delay(mut self, delay_seconds: u64) -> Self {
        self.delay_seconds = delay_seconds;
        self
    }

    pub fn depends_on(mut self, depends_on: Vec<Uuid>) -> Self {
        self.depends_on = depends_on;
        self
    }

    /// Build the `params` JSON actually inserted, folding in the reserved
    /// `_dependencies`/`_delay_until` keys.
    pub(crate) fn build_params(&self) -> Value {
        let mut params = self.params.clone();
        if !params.is_object() {
            params = serde_json::json!({});
        }
        let map = params.as_object_mut().expect("forced to object above");

        if !self.depends_on.is_empty() {
            map.insert(
                DEPENDENCIES_KEY.to_string(),
                serde_json::to_value(&self.depends_on).unwrap(),
            );
        }
        if self.delay_seconds > 0 {
            let until = Utc::now() + chrono::Duration::seconds(self.delay_seconds as i64);
            map.insert(DELAY_UNTIL_KEY.to_string(), Value::String(until.to_rfc3339()));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_values_map_to_expected_weights() {
        assert_eq!(i16::from(TaskPriority::Critical), 1);
        assert_eq!(i16::from(TaskPriority::High), 2);
        assert_eq!(i16::from(TaskPriority::Normal), 5);
        assert_eq!(i16::from(TaskPriority::Low), 8);
        assert_eq!(i16::from(TaskPriority::Background), 10);
    }

    #[test]
    fn build_params_folds_in_dependencies_and_delay() {
        let dep = Uuid::new_v4();
        let req = EnqueueRequest::new("agent", "kind", serde_json::json!({"x": 1}))
            .depends_on(vec![dep])
            .with_delay(30);

        let params = req.build_params();
        assert_eq!(params["x"], 1);
        assert_eq!(params[DEPENDENCIES_KEY][0], dep.to_string());
        assert!(params.get(DELAY_UNTIL_KEY).is_some());
    }

    #[test]
    fn delay_zero_omits_delay_until() {
        let req = EnqueueRequest::new("agent", "kind", serde_json::json!({}));
        let params = req.build_params();
        assert!(params.get(DELAY_UNTIL_KEY).is_none());
    }

    #[test]
    fn task_accessors_parse_reserved_keys() {
        let dep = Uuid::new_v4();
        let task = Task {
            task_id: Uuid::new_v4(),
            agent: "a".into(),
            kind: "k".into(),
            params: serde_json::json!({
                DEPENDENCIES_KEY: [dep.to_string()],
                DELAY_UNTIL_KEY: "2026-01-01T00:00:00Z",
            }),
            priority: 5,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: 3,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        assert_eq!(task.dependencies(), vec![dep]);
        assert!(task.delay_until().is_some());
    }
}
