//! Application settings storage
//!
//! Stores configuration like the Gemini API key in a JSON file in the app data
//! directory. Environment variables take precedence over stored values.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::ai_client::DEFAULT_MODEL;

/// Global settings instance
static SETTINGS: RwLock<Option<Settings>> = RwLock::new(None);

/// Path to config file (set during init)
static CONFIG_PATH: RwLock<Option<PathBuf>> = RwLock::new(None);

pub const DB_FILE_NAME: &str = ".branchchat.db";
pub const DEFAULT_BIND: &str = "127.0.0.1:3741";
pub const DEFAULT_OWNER: &str = "local";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub gemini_api_key: Option<String>,
    /// Model used for generation when a request does not name one
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Model used for summaries and titles (None = default_model)
    #[serde(default)]
    pub summary_model: Option<String>,
    #[serde(default)]
    pub custom_db_path: Option<String>,
    #[serde(default = "default_bind")]
    pub bind_addr: String,
    /// Owner id used when a request carries no X-User-Id header
    #[serde(default = "default_owner")]
    pub default_owner: String,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_owner() -> String {
    DEFAULT_OWNER.to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            default_model: default_model(),
            summary_model: None,
            custom_db_path: None,
            bind_addr: default_bind(),
            default_owner: default_owner(),
        }
    }
}

impl Settings {
    /// Load settings from disk or create default
    fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "settings file unreadable, using defaults");
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }

    /// Save settings to disk
    fn save(&self, path: &Path) -> Result<(), String> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        fs::write(path, content)
            .map_err(|e| format!("Failed to write settings: {}", e))?;

        Ok(())
    }
}

/// Platform data directory for branchchat files
pub fn app_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("branchchat"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Initialize settings with the app data directory
pub fn init(app_data_dir: PathBuf) {
    let config_path = app_data_dir.join("settings.json");
    let settings = Settings::load(&config_path);

    if let Ok(mut path) = CONFIG_PATH.write() {
        *path = Some(config_path);
    }
    if let Ok(mut guard) = SETTINGS.write() {
        *guard = Some(settings);
    }
}

/// Current settings (defaults if not initialized)
pub fn snapshot() -> Settings {
    SETTINGS
        .read()
        .ok()
        .and_then(|guard| guard.clone())
        .unwrap_or_default()
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn update<F: FnOnce(&mut Settings)>(apply: F) -> Result<(), String> {
    let mut settings_guard = SETTINGS.write()
        .map_err(|_| "Failed to acquire settings lock")?;

    let settings = settings_guard.get_or_insert_with(Settings::default);
    apply(settings);

    // Save to disk
    let config_path = CONFIG_PATH.read()
        .map_err(|_| "Failed to acquire config path lock")?
        .clone()
        .ok_or("Settings not initialized")?;

    settings.save(&config_path)
}

// ==================== Gemini API Key ====================

/// Get the current API key (checks env var first, then stored setting)
pub fn get_api_key() -> Option<String> {
    // Environment variable takes precedence
    if let Some(key) = env_value("GEMINI_API_KEY") {
        return Some(key);
    }

    // Fall back to stored setting
    let guard = SETTINGS.read().ok()?;
    let settings = guard.as_ref()?;
    settings.gemini_api_key.clone().filter(|k| !k.is_empty())
}

/// Check if API key is available
pub fn has_api_key() -> bool {
    get_api_key().is_some()
}

/// Set and save the API key
pub fn set_api_key(key: String) -> Result<(), String> {
    update(|settings| {
        settings.gemini_api_key = if key.is_empty() { None } else { Some(key) };
    })?;
    tracing::info!("API key saved to settings");
    Ok(())
}

/// Get masked API key for display (shows first 8 / last 4 chars)
pub fn get_masked_api_key() -> Option<String> {
    get_api_key().map(|key| mask_key(&key))
}

fn mask_key(key: &str) -> String {
    if key.is_ascii() && key.len() > 12 {
        format!("{}...{}", &key[..8], &key[key.len() - 4..])
    } else {
        "*".repeat(key.chars().count())
    }
}

// ==================== Models ====================

/// Generation model (BRANCHCHAT_MODEL env var, then stored setting)
pub fn get_default_model() -> String {
    env_value("BRANCHCHAT_MODEL").unwrap_or_else(|| snapshot().default_model)
}

pub fn set_default_model(model: String) -> Result<(), String> {
    update(|settings| settings.default_model = model)
}

/// Model for summaries and titles
pub fn get_summary_model() -> String {
    let settings = snapshot();
    settings.summary_model.unwrap_or_else(get_default_model)
}

// ==================== Server ====================

pub fn get_bind_addr() -> String {
    env_value("BRANCHCHAT_BIND").unwrap_or_else(|| snapshot().bind_addr)
}

pub fn get_default_owner() -> String {
    snapshot().default_owner
}

pub fn get_custom_db_path() -> Option<String> {
    snapshot().custom_db_path
}

/// Resolve the database file.
///
/// Order: explicit argument, BRANCHCHAT_DB, stored custom path, the nearest
/// `.branchchat.db` walking up from the working directory, then the app data dir.
pub fn find_database(db_arg: Option<&str>) -> PathBuf {
    // 1. CLI argument
    if let Some(path) = db_arg {
        return PathBuf::from(path);
    }

    // 2. Environment variable
    if let Some(path) = env_value("BRANCHCHAT_DB") {
        return PathBuf::from(path);
    }

    // 3. Stored setting
    if let Some(path) = get_custom_db_path() {
        return PathBuf::from(path);
    }

    // 4. Walk up directory tree for .branchchat.db
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(found) = find_upwards(&cwd, DB_FILE_NAME) {
            return found;
        }
    }

    // 5. Default app data directory
    app_data_dir().join("branchchat.db")
}

fn find_upwards(start: &Path, file_name: &str) -> Option<PathBuf> {
    let mut dir = start;
    loop {
        let candidate = dir.join(file_name);
        if candidate.exists() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
}
