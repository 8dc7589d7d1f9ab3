use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single message row. `id` is a dense integer so arrival order is
/// preserved within the same second; everything else exchanged with
/// callers elsewhere in the fabric uses opaque UUID-shaped strings.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: i64,
    pub channel: String,
    pub sender: String,
    pub recipient: Option<String>,
    pub payload: Value,
    pub priority: i16,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_by: Option<String>,
}
