use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use lectern_llm::{
    DEFAULT_BASE_URL, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_TIMEOUT, ResearchMode, TransportConfig,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::{DEFAULT_FLUSH_INTERVAL, DEFAULT_PROVIDER, TurnOptions};

pub const SETTINGS_DIRECTORY_NAME: &str = "lectern";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "LECTERN_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub research_mode: ResearchMode,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            provider: default_provider(),
            research_mode: ResearchMode::default(),
            flush_interval_ms: default_flush_interval_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            temperature: None,
            max_tokens: None,
        }
    }
}

impl ClientSettings {
    pub fn normalized(mut self) -> Self {
        self.base_url = non_blank_or(&self.base_url, default_base_url);
        self.provider = non_blank_or(&self.provider, default_provider);
        if self.flush_interval_ms == 0 {
            self.flush_interval_ms = default_flush_interval_ms();
        }
        if self.idle_timeout_secs == 0 {
            self.idle_timeout_secs = default_idle_timeout_secs();
        }
        if self.connect_timeout_secs == 0 {
            self.connect_timeout_secs = default_connect_timeout_secs();
        }
        self.temperature = self.temperature.filter(|value| value.is_finite());
        self.max_tokens = self.max_tokens.filter(|value| *value > 0);
        self
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig::new(&self.base_url)
            .with_idle_timeout(Duration::from_secs(self.idle_timeout_secs))
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
    }

    pub fn turn_options(&self) -> TurnOptions {
        let mut options = TurnOptions::new(&self.provider);
        options.research_mode = self.research_mode;
        options.temperature = self.temperature;
        options.max_tokens = self.max_tokens;
        options
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ClientSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".lectern"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from(Self::figment(&config_path), &config_path);
        Self::with_settings(config_path, settings)
    }

    /// Like [`SettingsStore::new`] but ignores `LECTERN_*` variables.
    pub fn from_file(config_path: PathBuf) -> Self {
        let figment = Figment::from(Serialized::defaults(ClientSettings::default()))
            .merge(Json::file(&config_path));
        let settings = Self::load_from(figment, &config_path);
        Self::with_settings(config_path, settings)
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ClientSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ClientSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn with_settings(config_path: PathBuf, settings: ClientSettings) -> Self {
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ClientSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    fn load_from(figment: Figment, path: &Path) -> ClientSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }

        match figment.extract::<ClientSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(path = ?path, error = %error, "failed to parse settings, using defaults");
                ClientSettings::default()
            }
        }
    }

    /// Stages the encoded settings next to the live file, then swaps it in.
    fn persist(&self, settings: &ClientSettings) -> Result<(), SettingsError> {
        let target = self.config_path.as_path();
        let directory = target.parent().filter(|dir| !dir.as_os_str().is_empty());
        if let Some(directory) = directory {
            std::fs::create_dir_all(directory).context(PrepareDirectorySnafu {
                stage: "create-client-config-dir",
                directory,
            })?;
        }

        let mut encoded = serde_json::to_vec_pretty(settings).context(EncodeSnafu {
            stage: "encode-client-settings",
        })?;
        encoded.push(b'\n');

        let staged = target.with_extension("json.tmp");
        std::fs::write(&staged, &encoded).context(StageSnafu {
            stage: "write-client-settings-temp",
            staged: staged.as_path(),
        })?;
        if let Err(source) = std::fs::rename(&staged, target) {
            let _ = std::fs::remove_file(&staged);
            return Err(SettingsError::Commit {
                stage: "swap-client-settings-file",
                target: target.to_path_buf(),
                source,
            });
        }

        tracing::info!(path = ?target, bytes = encoded.len(), "saved client settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("could not create config directory {directory:?} (`{stage}`): {source}"))]
    PrepareDirectory {
        stage: &'static str,
        directory: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("could not encode client settings (`{stage}`): {source}"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("could not stage settings in {staged:?} (`{stage}`): {source}"))]
    Stage {
        stage: &'static str,
        staged: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("could not replace {target:?} with staged settings (`{stage}`): {source}"))]
    Commit {
        stage: &'static str,
        target: PathBuf,
        source: std::io::Error,
    },
}

fn non_blank_or(value: &str, default: fn() -> String) -> String {
    let value = value.trim();
    if value.is_empty() {
        default()
    } else {
        value.to_string()
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

fn default_flush_interval_ms() -> u64 {
    u64::try_from(DEFAULT_FLUSH_INTERVAL.as_millis()).unwrap_or(16)
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT.as_secs()
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_secs()
}
