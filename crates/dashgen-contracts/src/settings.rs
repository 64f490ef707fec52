use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct SettingsPayload {
    api_key: Option<String>,
    last_prompt: Option<String>,
}

/// Small file-backed settings store: the saved API key and the last
/// submitted prompt. The browser original keeps both in local storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    path: PathBuf,
    payload: SettingsPayload,
}

impl Settings {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let payload = read_payload(&path).unwrap_or_default();
        Self { path, payload }
    }

    pub fn api_key(&self) -> Option<&str> {
        self.payload
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn last_prompt(&self) -> Option<&str> {
        self.payload.last_prompt.as_deref()
    }

    pub fn set_api_key(&mut self, value: impl Into<String>) -> anyhow::Result<()> {
        self.payload.api_key = Some(value.into());
        self.save()
    }

    pub fn clear_api_key(&mut self) -> anyhow::Result<()> {
        self.payload.api_key = None;
        self.save()
    }

    pub fn set_last_prompt(&mut self, value: impl Into<String>) -> anyhow::Result<()> {
        self.payload.last_prompt = Some(value.into());
        self.save()
    }

    fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&self.payload)?)?;
        Ok(())
    }
}

fn read_payload(path: &Path) -> Option<SettingsPayload> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

#[cfg(test)]
mod tests {
    use super::Settings;

    #[test]
    fn api_key_round_trip() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("settings.json");

        let mut settings = Settings::load(&path);
        assert!(settings.api_key().is_none());

        settings.set_api_key("sk-test")?;
        assert_eq!(Settings::load(&path).api_key(), Some("sk-test"));

        settings.clear_api_key()?;
        assert!(Settings::load(&path).api_key().is_none());
        Ok(())
    }

    #[test]
    fn blank_api_key_reads_as_absent() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("settings.json");

        let mut settings = Settings::load(&path);
        settings.set_api_key("   ")?;
        assert!(settings.api_key().is_none());
        Ok(())
    }

    #[test]
    fn last_prompt_persists() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("settings.json");

        let mut settings = Settings::load(&path);
        settings.set_last_prompt("a boat at dusk")?;
        assert_eq!(
            Settings::load(&path).last_prompt(),
            Some("a boat at dusk")
        );
        Ok(())
    }
}
