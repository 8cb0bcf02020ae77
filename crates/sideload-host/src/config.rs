//! Host configuration
//!
//! Layered the usual way: built-in defaults, then an optional file (format
//! taken from its extension), then environment variables. Environment keys
//! use the prefix, a single `_`, and `__` for nesting, e.g.
//! `SIDELOAD_DEBOUNCE_MS=500`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config as Cfg, Environment, File, FileFormat};
use serde::Deserialize;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "SIDELOAD";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Settings for the host and every realm watcher it creates
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Root under which each realm gets `<root>/<realm name>/`
    pub sideload_root: PathBuf,
    /// Extension of module files, without the dot
    pub extension: String,
    /// Top-level type carrying lifecycle callbacks
    pub entry_type: String,
    /// Callback run after the first successful load
    pub on_load: String,
    /// Callback run after every successful reload
    pub on_reload: String,
    /// Quiet period used to coalesce bursts of events per file
    pub debounce_ms: u64,
    /// Skip a reload when the image content did not change
    pub skip_unchanged: bool,
    /// Create missing realm directories at startup
    pub create_missing_dirs: bool,
    /// Realm names served by [`ConfiguredRealms`](crate::bootstrap::ConfiguredRealms)
    pub realms: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            sideload_root: PathBuf::from("sideload"),
            extension: "module".to_string(),
            entry_type: "Addon".to_string(),
            on_load: "OnLoad".to_string(),
            on_reload: "OnReload".to_string(),
            debounce_ms: 200,
            skip_unchanged: true,
            create_missing_dirs: true,
            realms: Vec::new(),
        }
    }
}

impl HostConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load defaults, an optional file and `SIDELOAD_*` environment overrides
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        Self::load_with_env(path, ENV_PREFIX)
    }

    /// Like [`load`](Self::load) with a custom environment prefix
    pub fn load_with_env(path: Option<&Path>, env_prefix: &str) -> ConfigResult<Self> {
        let mut builder = Cfg::builder();

        if let Some(path) = path {
            let format = detect_format(path)?;
            let name = path.to_string_lossy();
            builder = builder.add_source(File::new(&name, format).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("realms"),
            )
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        let config: Self = config
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration text in an explicit format
    pub fn from_str(content: &str, format: FileFormat) -> ConfigResult<Self> {
        let config: Self = Cfg::builder()
            .add_source(File::from_str(content, format))
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.extension.is_empty() || self.extension.contains('.') {
            return Err(ConfigError::Invalid(format!(
                "extension must be a bare extension, got {:?}",
                self.extension
            )));
        }
        if self.entry_type.is_empty() {
            return Err(ConfigError::Invalid("entry_type must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn with_sideload_root<P: AsRef<Path>>(mut self, root: P) -> Self {
        self.sideload_root = root.as_ref().to_path_buf();
        self
    }

    pub fn with_extension(mut self, ext: &str) -> Self {
        self.extension = ext.trim_start_matches('.').to_string();
        self
    }

    pub fn with_debounce(mut self, duration: Duration) -> Self {
        self.debounce_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_skip_unchanged(mut self, enabled: bool) -> Self {
        self.skip_unchanged = enabled;
        self
    }

    pub fn with_realm(mut self, name: &str) -> Self {
        self.realms.push(name.to_string());
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Whether `path` names a module file
    pub fn is_module_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(&self.extension))
    }
}

/// Detect configuration format from file extension
pub fn detect_format(path: &Path) -> ConfigResult<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        "ini" => Ok(FileFormat::Ini),
        "ron" => Ok(FileFormat::Ron),
        "json5" => Ok(FileFormat::Json5),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.extension, "module");
        assert_eq!(config.entry_type, "Addon");
        assert_eq!(config.on_load, "OnLoad");
        assert_eq!(config.on_reload, "OnReload");
        assert!(config.skip_unchanged);
        assert!(config.realms.is_empty());
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(Path::new("host.toml")).unwrap(), FileFormat::Toml);
        assert_eq!(detect_format(Path::new("host.yml")).unwrap(), FileFormat::Yaml);
        assert_eq!(detect_format(Path::new("host.json")).unwrap(), FileFormat::Json);
        assert!(detect_format(Path::new("host.txt")).is_err());
        assert!(detect_format(Path::new("host")).is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = HostConfig::from_str(
            r#"
sideload_root = "/srv/sideload"
debounce_ms = 50
realms = ["client", "server"]
"#,
            FileFormat::Toml,
        )
        .unwrap();

        assert_eq!(config.sideload_root, PathBuf::from("/srv/sideload"));
        assert_eq!(config.debounce(), Duration::from_millis(50));
        assert_eq!(config.realms, vec!["client", "server"]);
        assert_eq!(config.extension, "module");
    }

    #[test]
    fn test_rejects_dotted_extension() {
        let err = HostConfig::from_str(r#"{ "extension": "so.1" }"#, FileFormat::Json).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_file_and_env() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("host.yaml");
        std::fs::write(&path, "extension: dll\nskip_unchanged: false\n").unwrap();

        unsafe { std::env::set_var("SIDELOAD_CFGTEST_DEBOUNCE_MS", "750") };
        let config = HostConfig::load_with_env(Some(&path), "SIDELOAD_CFGTEST").unwrap();
        unsafe { std::env::remove_var("SIDELOAD_CFGTEST_DEBOUNCE_MS") };

        assert_eq!(config.extension, "dll");
        assert!(!config.skip_unchanged);
        assert_eq!(config.debounce_ms, 750);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(HostConfig::load_with_env(Some(&path), "SIDELOAD_CFGTEST_MISSING").is_err());
    }

    #[test]
    fn test_is_module_file() {
        let config = HostConfig::default();
        assert!(config.is_module_file(Path::new("/x/a.module")));
        assert!(config.is_module_file(Path::new("/x/a.MODULE")));
        assert!(!config.is_module_file(Path::new("/x/a.module.tmp")));
        assert!(!config.is_module_file(Path::new("/x/module")));
    }
}
