mod history;

pub use history::{TaskHistory, TaskRecord, HISTORY_LIMIT};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Simplified classification of a vendor task. Hard failures (missing key,
/// transport errors, non-2xx responses) travel on the error channel instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Completed,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    TextToImage,
    ImageEdit,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::TextToImage => "text_to_image",
            TaskKind::ImageEdit => "image_edit",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// What a successful submission hands back: the opaque vendor task id plus
/// the initial status string, nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub task_id: String,
    pub task_status: String,
    pub request_id: String,
}

/// Outcome of a single status poll. Recomputed fresh on every call; nothing
/// is cached between polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusReport {
    pub state: TaskState,
    pub message: String,
    #[serde(default)]
    pub images: Vec<String>,
}
