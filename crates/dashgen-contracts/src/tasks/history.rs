use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TaskKind;

/// Only the most recent submissions are kept, newest first.
pub const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub task_id: String,
    pub kind: TaskKind,
    pub prompt: String,
    pub model: String,
    pub function: Option<String>,
    pub size: Option<String>,
    #[serde(default = "default_count")]
    pub count: u64,
    pub status: String,
    pub result: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
    pub last_polled_at: Option<String>,
}

impl TaskRecord {
    pub fn new(
        kind: TaskKind,
        task_id: impl Into<String>,
        prompt: impl Into<String>,
        model: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        let now = now_utc_iso();
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            kind,
            prompt: prompt.into(),
            model: model.into(),
            function: None,
            size: None,
            count: 1,
            status: status.into(),
            result: None,
            images: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
            last_polled_at: None,
        }
    }
}

/// File-backed task history, written whole on every mutation. A missing or
/// malformed file loads as an empty history.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskHistory {
    path: PathBuf,
    entries: Vec<TaskRecord>,
}

impl TaskHistory {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = read_entries(&path).unwrap_or_default();
        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[TaskRecord] {
        &self.entries
    }

    pub fn recent(&self, limit: usize) -> &[TaskRecord] {
        &self.entries[..limit.min(self.entries.len())]
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskRecord> {
        self.entries.iter().find(|entry| entry.task_id == task_id)
    }

    pub fn add(&mut self, record: TaskRecord) -> anyhow::Result<()> {
        self.entries.insert(0, record);
        self.entries.truncate(HISTORY_LIMIT);
        self.save()
    }

    /// Applies `apply` to the entry for `task_id`, refreshing its updated
    /// timestamp. Returns false when no entry matches.
    pub fn update(
        &mut self,
        task_id: &str,
        apply: impl FnOnce(&mut TaskRecord),
    ) -> anyhow::Result<bool> {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.task_id == task_id)
        else {
            return Ok(false);
        };
        apply(entry);
        entry.updated_at = now_utc_iso();
        self.save()?;
        Ok(true)
    }

    pub fn remove(&mut self, task_id: &str) -> anyhow::Result<bool> {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.task_id != task_id);
        if self.entries.len() == before {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    pub fn clear(&mut self) -> anyhow::Result<()> {
        self.entries.clear();
        self.save()
    }

    fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&self.entries)?)?;
        Ok(())
    }
}

fn read_entries(path: &Path) -> Option<Vec<TaskRecord>> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn default_count() -> u64 {
    1
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
