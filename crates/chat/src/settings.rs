use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::identity::Identity;

pub const SETTINGS_DIRECTORY_NAME: &str = "roomchat";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "messages.db";
pub const ENV_PREFIX: &str = "ROOMCHAT_";
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_database_location")]
    pub database_location: String,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub last_room: Option<String>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            database_location: default_database_location(),
            log_filter: default_log_filter(),
            display_name: None,
            user_id: None,
            last_room: None,
        }
    }
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        self.database_location = if self.database_location.trim().is_empty() {
            default_database_location()
        } else {
            self.database_location.trim().to_string()
        };
        self.log_filter = if self.log_filter.trim().is_empty() {
            default_log_filter()
        } else {
            self.log_filter.trim().to_string()
        };
        self.display_name = non_blank(self.display_name);
        self.user_id = non_blank(self.user_id);
        // Room ids are opaque: only drop empty values, never trim them.
        self.last_room = self.last_room.filter(|room| !room.is_empty());
        self
    }

    /// Identity remembered from a previous run, if both halves are known.
    pub fn identity(&self) -> Option<Identity> {
        Some(Identity::new(
            self.display_name.clone()?,
            self.user_id.clone()?,
        ))
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ChatSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".roomchat"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ChatSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> ChatSettings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        // A missing file contributes nothing; environment overrides still apply.
        let figment = Figment::from(Serialized::defaults(ChatSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                ChatSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_database_location() -> String {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".roomchat"))
        .join(DATABASE_FILE_NAME)
        .display()
        .to_string()
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    struct TempConfigDir {
        path: PathBuf,
    }

    impl TempConfigDir {
        fn new(label: &str) -> Self {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |duration| duration.as_nanos());
            let path = std::env::temp_dir().join(format!(
                "roomchat-settings-{label}-{}-{nanos}",
                std::process::id()
            ));
            std::fs::create_dir_all(&path).expect("create temp dir");
            Self { path }
        }

        fn settings_path(&self) -> PathBuf {
            self.path.join(SETTINGS_FILE_NAME)
        }
    }

    impl Drop for TempConfigDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempConfigDir::new("missing");
        let store = SettingsStore::new(dir.settings_path());
        let settings = store.settings();

        assert_eq!(settings.log_filter, DEFAULT_LOG_FILTER);
        assert!(settings.database_location.ends_with(DATABASE_FILE_NAME));
        assert_eq!(settings.identity(), None);
    }

    #[test]
    fn file_values_are_merged_and_normalized() {
        let dir = TempConfigDir::new("merge");
        std::fs::write(
            dir.settings_path(),
            r#"{ "display_name": "  Alice ", "user_id": "u1", "log_filter": " ", "last_room": " job42" }"#,
        )
        .expect("write settings");

        let settings = SettingsStore::new(dir.settings_path()).settings();
        assert_eq!(settings.identity(), Some(Identity::new("Alice", "u1")));
        assert_eq!(settings.log_filter, DEFAULT_LOG_FILTER);
        assert_eq!(settings.last_room.as_deref(), Some(" job42"));
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = TempConfigDir::new("malformed");
        std::fs::write(dir.settings_path(), "{ not json").expect("write settings");

        let settings = SettingsStore::new(dir.settings_path()).settings();
        assert_eq!(*settings, ChatSettings::default());
    }

    #[test]
    fn update_persists_and_reloads() {
        let dir = TempConfigDir::new("update");
        let store = SettingsStore::new(dir.settings_path());

        let mut settings = store.settings().as_ref().clone();
        settings.display_name = Some("Alice".to_string());
        settings.user_id = Some("u1".to_string());
        settings.last_room = Some("job42".to_string());
        store.update(settings).expect("persist");

        assert!(!dir.settings_path().with_extension("json.tmp").exists());
        let reloaded = SettingsStore::new(dir.settings_path()).settings();
        assert_eq!(reloaded.identity(), Some(Identity::new("Alice", "u1")));
        assert_eq!(reloaded.last_room.as_deref(), Some("job42"));
    }
}
