use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const CURRENT_VERSION: u32 = 2;
const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "pagestream";

/// What the worker does when the engine fails to rasterize a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenderFailurePolicy {
    /// End the session as failed, naming the page
    #[default]
    AbortSession,
    /// Drop the page from the pending set and keep going
    SkipPage,
}

impl RenderFailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderFailurePolicy::AbortSession => "abort_session",
            RenderFailurePolicy::SkipPage => "skip_page",
        }
    }
}

impl fmt::Display for RenderFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenderFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abort_session" | "abort" => Ok(RenderFailurePolicy::AbortSession),
            "skip_page" | "skip" => Ok(RenderFailurePolicy::SkipPage),
            other => Err(format!(
                "unknown render failure policy '{other}', expected abort_session or skip_page"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Size of the shared frame area; one encoded page must fit
    #[serde(default = "default_frame_buffer_bytes")]
    pub frame_buffer_bytes: usize,

    /// How often the consumer drains frame notices
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_render_scale")]
    pub render_scale: f32,

    #[serde(default = "default_page_width")]
    pub page_width: u32,

    #[serde(default = "default_page_height")]
    pub page_height: u32,

    #[serde(default = "default_page_margin")]
    pub page_margin: u32,

    #[serde(default)]
    pub on_render_error: RenderFailurePolicy,

    /// Grace period for a worker process to exit before it is killed
    #[serde(default = "default_teardown_timeout_ms")]
    pub teardown_timeout_ms: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_frame_buffer_bytes() -> usize {
    100_000_000
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_render_scale() -> f32 {
    2.0
}

fn default_page_width() -> u32 {
    1190
}

fn default_page_height() -> u32 {
    1684
}

fn default_page_margin() -> u32 {
    5
}

fn default_teardown_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            frame_buffer_bytes: default_frame_buffer_bytes(),
            poll_interval_ms: default_poll_interval_ms(),
            render_scale: default_render_scale(),
            page_width: default_page_width(),
            page_height: default_page_height(),
            page_margin: default_page_margin(),
            on_render_error: RenderFailurePolicy::default(),
            teardown_timeout_ms: default_teardown_timeout_ms(),
            log_level: default_log_level(),
        }
    }
}

impl PipelineSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    /// Configured log level; unknown names fall back to `Info`.
    pub fn log_level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or_else(|_| {
            warn!("Unknown log level '{}', using info", self.log_level);
            log::LevelFilter::Info
        })
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

/// Loads settings from the default location, writing a default file on first
/// run. Any failure falls back to defaults.
pub fn load_settings() -> PipelineSettings {
    let Some(path) = config_path() else {
        warn!("Could not determine config directory, using default settings");
        return PipelineSettings::default();
    };

    if path.exists() {
        load_settings_from_path(&path)
    } else {
        info!("Settings file not found, creating with defaults at {path:?}");
        let settings = PipelineSettings::default();
        save_settings_to_file(&settings, &path);
        settings
    }
}

pub fn load_settings_from_path(path: &Path) -> PipelineSettings {
    let Some(mut settings) = parse_settings_file(path) else {
        return PipelineSettings::default();
    };

    if settings.version < CURRENT_VERSION {
        migrate_settings(&mut settings);
        save_settings_to_file(&settings, path);
    }

    settings
}

/// Like [`load_settings`], but never writes: a missing file means defaults
/// and migrations stay in memory. Used by worker processes.
pub fn read_settings() -> PipelineSettings {
    config_path()
        .filter(|path| path.exists())
        .map_or_else(PipelineSettings::default, |path| {
            read_settings_from_path(&path)
        })
}

pub fn read_settings_from_path(path: &Path) -> PipelineSettings {
    let Some(mut settings) = parse_settings_file(path) else {
        return PipelineSettings::default();
    };

    if settings.version < CURRENT_VERSION {
        migrate_settings(&mut settings);
    }

    settings
}

fn parse_settings_file(path: &Path) -> Option<PipelineSettings> {
    let content = fs::read_to_string(path)
        .inspect_err(|e| error!("Failed to read settings file {path:?}: {e}"))
        .ok()?;

    match serde_yaml::from_str::<PipelineSettings>(&content) {
        Ok(settings) => {
            debug!("Loaded settings from {path:?}");
            Some(settings)
        }
        Err(e) => {
            error!("Failed to parse settings file {path:?}: {e}");
            None
        }
    }
}

fn migrate_settings(settings: &mut PipelineSettings) {
    info!(
        "Migrating settings from v{} to v{}",
        settings.version, CURRENT_VERSION
    );

    // v1 stored the frame buffer size in megabytes
    if settings.version < 2 && settings.frame_buffer_bytes < 1 << 20 {
        settings.frame_buffer_bytes = settings.frame_buffer_bytes.saturating_mul(1_000_000);
    }

    settings.version = CURRENT_VERSION;
}

pub fn save_settings_to_file(settings: &PipelineSettings, path: &Path) {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            if let Err(e) = fs::create_dir_all(parent) {
                error!("Failed to create config directory {parent:?}: {e}");
                return;
            }
        }
    }

    let content = generate_settings_yaml(settings);

    match fs::write(path, content) {
        Ok(()) => debug!("Saved settings to {path:?}"),
        Err(e) => error!("Failed to save settings to {path:?}: {e}"),
    }
}

fn generate_settings_yaml(settings: &PipelineSettings) -> String {
    let mut content = String::new();

    content.push_str(SETTINGS_HEADER);
    content.push_str(&format!("version: {}\n", settings.version));
    content.push_str(&format!(
        "frame_buffer_bytes: {}\n",
        settings.frame_buffer_bytes
    ));
    content.push_str(&format!("poll_interval_ms: {}\n", settings.poll_interval_ms));
    content.push_str(&format!("render_scale: {}\n", settings.render_scale));
    content.push_str(&format!("page_width: {}\n", settings.page_width));
    content.push_str(&format!("page_height: {}\n", settings.page_height));
    content.push_str(&format!("page_margin: {}\n", settings.page_margin));
    content.push_str(&format!(
        "on_render_error: {}\n",
        settings.on_render_error.as_str()
    ));
    content.push_str(&format!(
        "teardown_timeout_ms: {}\n",
        settings.teardown_timeout_ms
    ));
    content.push_str(&format!("log_level: {}\n", settings.log_level));

    content
}

const SETTINGS_HEADER: &str = r#"# ============================================================================
# pagestream settings
# ============================================================================
# frame_buffer_bytes:  shared frame area; a rendered page larger than this
#                      ends the session with a buffer overflow
# on_render_error:     abort_session | skip_page
# log_level:           off | error | warn | info | debug | trace

"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = PipelineSettings::default();

        assert_eq!(settings.frame_buffer_bytes, 100_000_000);
        assert_eq!(settings.poll_interval(), Duration::from_millis(250));
        assert_eq!(settings.teardown_timeout(), Duration::from_secs(5));
        assert_eq!(settings.on_render_error, RenderFailurePolicy::AbortSession);
        assert_eq!(
            (settings.page_width, settings.page_height, settings.page_margin),
            (1190, 1684, 5)
        );
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let settings: PipelineSettings =
            serde_yaml::from_str("poll_interval_ms: 10\non_render_error: skip_page\n").unwrap();

        assert_eq!(settings.poll_interval_ms, 10);
        assert_eq!(settings.on_render_error, RenderFailurePolicy::SkipPage);
        assert_eq!(settings.render_scale, 2.0);
        assert_eq!(settings.version, CURRENT_VERSION);
    }

    #[test]
    fn generated_yaml_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILENAME);
        let settings = PipelineSettings {
            frame_buffer_bytes: 4096,
            on_render_error: RenderFailurePolicy::SkipPage,
            log_level: "debug".to_string(),
            ..PipelineSettings::default()
        };

        save_settings_to_file(&settings, &path);

        assert_eq!(load_settings_from_path(&path), settings);
    }

    #[test]
    fn old_version_is_migrated_and_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILENAME);
        fs::write(&path, "version: 1\nframe_buffer_bytes: 50\n").unwrap();

        let settings = load_settings_from_path(&path);

        assert_eq!(settings.version, CURRENT_VERSION);
        assert_eq!(settings.frame_buffer_bytes, 50_000_000);
        let rewritten = fs::read_to_string(&path).unwrap();
        assert!(rewritten.contains(&format!("version: {CURRENT_VERSION}")));
    }

    #[test]
    fn read_only_load_migrates_in_memory_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILENAME);
        let original = "version: 1\nframe_buffer_bytes: 50\n";
        fs::write(&path, original).unwrap();

        let settings = read_settings_from_path(&path);

        assert_eq!(settings.frame_buffer_bytes, 50_000_000);
        assert_eq!(fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn read_only_load_of_missing_file_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent").join(SETTINGS_FILENAME);

        assert_eq!(read_settings_from_path(&path), PipelineSettings::default());
        assert!(!path.exists());
        assert!(!dir.path().join("absent").exists());
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILENAME);
        fs::write(&path, "poll_interval_ms: [not a number\n").unwrap();

        assert_eq!(load_settings_from_path(&path), PipelineSettings::default());
    }

    #[test]
    fn policy_parses_cli_spellings() {
        assert_eq!(
            "skip_page".parse::<RenderFailurePolicy>(),
            Ok(RenderFailurePolicy::SkipPage)
        );
        assert_eq!(
            "abort".parse::<RenderFailurePolicy>(),
            Ok(RenderFailurePolicy::AbortSession)
        );
        assert!("retry".parse::<RenderFailurePolicy>().is_err());
    }

    #[test]
    fn unknown_log_level_falls_back_to_info() {
        let settings = PipelineSettings {
            log_level: "chatty".to_string(),
            ..PipelineSettings::default()
        };

        assert_eq!(settings.log_level_filter(), log::LevelFilter::Info);
    }
}
