use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

use crate::predict::PredictOptions;
use crate::server::ServerConfig;
use crate::train::TrainOptions;

/// Application configuration loaded from TOML config file.
/// Every field has a default, so the config file is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Where trained artifacts live (overrides the XDG data directory).
    pub artifact_dir: Option<PathBuf>,
    /// Historical catalog CSV used by `train` when no `--corpus` is given.
    pub corpus_path: Option<PathBuf>,
    /// Number of parallel workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    pub training: TrainOptions,
    pub predict: PredictOptions,
    pub server: ServerConfig,
}

impl AppConfig {
    /// Load config from `~/.config/trailgrade/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match Self::parse(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// CLI flag, then config file, then the XDG default.
    pub fn resolve_artifact_dir(&self, flag: Option<PathBuf>) -> PathBuf {
        flag.or_else(|| self.artifact_dir.clone())
            .unwrap_or_else(default_artifact_dir)
    }

    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Default artifact directory under the XDG data directory.
pub fn default_artifact_dir() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        dirs.data_dir().join("model")
    } else {
        // Fallback: current directory
        PathBuf::from("model")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::scaler::ScalerKind;

    #[test]
    fn test_empty_config_is_default() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.training.clusters, 3);
        assert_eq!(config.training.labels, vec!["Easy", "Medium", "Hard"]);
        assert_eq!(config.training.forest.n_trees, 200);
        assert_eq!(config.training.cleaning.max_speed, 5.0);
        assert_eq!(config.training.cleaning.max_break_ratio, 1.5);
        assert_eq!(config.predict.neighbors, 5);
        assert_eq!(config.server.bind, "127.0.0.1:5000");
        assert!(config.artifact_dir.is_none());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = AppConfig::parse(
            r#"
workers = 4
artifact_dir = "/srv/trailgrade"

[training]
clusters = 4
labels = ["T1", "T2", "T3", "T4"]
scaler = "standard"
cluster_on_duration = false

[training.forest]
n_trees = 50

[training.cleaning]
max_speed = 4.0

[predict]
neighbors = 10
"#,
        )
        .unwrap();

        assert_eq!(config.resolve_workers(), 4);
        assert_eq!(config.training.clusters, 4);
        assert_eq!(config.training.scaler, ScalerKind::Standard);
        assert!(!config.training.cluster_on_duration);
        assert_eq!(config.training.forest.n_trees, 50);
        assert_eq!(config.training.forest.max_depth, 15);
        assert_eq!(config.training.cleaning.max_speed, 4.0);
        assert_eq!(config.training.cleaning.max_break_ratio, 1.5);
        assert_eq!(config.training.seed, 42);
        assert_eq!(config.predict.neighbors, 10);
        assert!(config.predict.moving_speed_threshold.is_some());
        assert_eq!(
            config.resolve_artifact_dir(None),
            PathBuf::from("/srv/trailgrade")
        );
        assert_eq!(
            config.resolve_artifact_dir(Some(PathBuf::from("here"))),
            PathBuf::from("here")
        );
    }

    #[test]
    fn test_auto_workers_at_least_one() {
        assert!(AppConfig::default().resolve_workers() >= 1);
    }

    #[test]
    fn test_bad_value_is_an_error() {
        assert!(AppConfig::parse("[training]\nclusters = \"three\"").is_err());
    }
}
