use reunite_core::{DistanceMetric, MatchConfig, MatchPolicy};
use serde::de::{DeserializeOwned, IntoDeserializer};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const CONFIG_FILE: &str = "reunite/reunited.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
}

/// Daemon configuration.
///
/// Built from defaults, then the TOML file (`$REUNITE_CONFIG`, or
/// `$XDG_CONFIG_HOME/reunite/reunited.toml` when present), then `REUNITE_*`
/// environment variables. Later sources win.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Root directory for stored reference images.
    pub media_dir: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Unset means the threshold calibrated for ArcFace under `distance_metric`.
    pub match_threshold: Option<f32>,
    pub match_policy: MatchPolicy,
    pub distance_metric: DistanceMetric,
    /// Upper bound on extracting the descriptor of a query photo.
    pub query_timeout_secs: u64,
    pub max_image_bytes: usize,
    /// Faces described per image; only the first is used for matching.
    pub max_faces: usize,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
}

/// On-disk form. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    db_path: Option<PathBuf>,
    media_dir: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    match_threshold: Option<f32>,
    match_policy: Option<MatchPolicy>,
    distance_metric: Option<DistanceMetric>,
    query_timeout_secs: Option<u64>,
    max_image_bytes: Option<usize>,
    max_faces: Option<usize>,
    system_bus: Option<bool>,
}

impl Config {
    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load with an arbitrary environment lookup.
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::with_data_dir(&data_dir(&env));
        if let Some(path) = config_path(&env) {
            config.merge_file(&path)?;
        }
        config.apply_env(&env)?;
        Ok(config)
    }

    /// Defaults with every data path under `data_dir`.
    pub fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            db_path: data_dir.join("gallery.db"),
            media_dir: data_dir.join("media"),
            model_dir: data_dir.join("models"),
            match_threshold: None,
            match_policy: MatchPolicy::default(),
            distance_metric: DistanceMetric::default(),
            query_timeout_secs: 10,
            max_image_bytes: reunite_core::ingest::DEFAULT_MAX_IMAGE_BYTES,
            max_faces: reunite_models::DEFAULT_MAX_FACES,
            system_bus: false,
        }
    }

    pub fn match_config(&self) -> MatchConfig {
        MatchConfig {
            threshold: self
                .match_threshold
                .unwrap_or_else(|| reunite_models::recommended_threshold(self.distance_metric)),
            policy: self.match_policy,
            metric: self.distance_metric,
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let file: ConfigFile = toml::from_str(&text)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        tracing::debug!(path = %path.display(), "config file loaded");

        let ConfigFile {
            db_path,
            media_dir,
            model_dir,
            match_threshold,
            match_policy,
            distance_metric,
            query_timeout_secs,
            max_image_bytes,
            max_faces,
            system_bus,
        } = file;
        set(&mut self.db_path, db_path);
        set(&mut self.media_dir, media_dir);
        set(&mut self.model_dir, model_dir);
        set(&mut self.match_threshold, match_threshold.map(Some));
        set(&mut self.match_policy, match_policy);
        set(&mut self.distance_metric, distance_metric);
        set(&mut self.query_timeout_secs, query_timeout_secs);
        set(&mut self.max_image_bytes, max_image_bytes);
        set(&mut self.max_faces, max_faces);
        set(&mut self.system_bus, system_bus);
        Ok(())
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        set(&mut self.db_path, env("REUNITE_DB_PATH").map(PathBuf::from));
        set(&mut self.media_dir, env("REUNITE_MEDIA_DIR").map(PathBuf::from));
        set(&mut self.model_dir, env("REUNITE_MODEL_DIR").map(PathBuf::from));
        set(&mut self.match_threshold, env_parse(env, "REUNITE_MATCH_THRESHOLD", |v| v.parse().ok())?.map(Some));
        set(&mut self.match_policy, env_parse(env, "REUNITE_MATCH_POLICY", parse_enum)?);
        set(&mut self.distance_metric, env_parse(env, "REUNITE_DISTANCE_METRIC", parse_enum)?);
        set(&mut self.query_timeout_secs, env_parse(env, "REUNITE_QUERY_TIMEOUT_SECS", |v| v.parse().ok())?);
        set(&mut self.max_image_bytes, env_parse(env, "REUNITE_MAX_IMAGE_BYTES", |v| v.parse().ok())?);
        set(&mut self.max_faces, env_parse(env, "REUNITE_MAX_FACES", |v| v.parse().ok())?);
        set(&mut self.system_bus, env_parse(env, "REUNITE_SYSTEM_BUS", parse_bool)?);
        Ok(())
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn env_parse<T>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, ConfigError> {
    match env(key) {
        None => Ok(None),
        Some(value) => match parse(value.trim()) {
            Some(parsed) => Ok(Some(parsed)),
            None => Err(ConfigError::InvalidEnv { key, value }),
        },
    }
}

/// Parse a snake_case enum name, e.g. `best_match`.
fn parse_enum<T: DeserializeOwned>(value: &str) -> Option<T> {
    let de: serde::de::value::StrDeserializer<'_, serde::de::value::Error> = value.into_deserializer();
    T::deserialize(de).ok()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("reunite")
}

/// `$REUNITE_CONFIG` is used even if missing, so a typo fails loudly. The
/// XDG location is optional.
fn config_path(env: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(explicit) = env("REUNITE_CONFIG") {
        return Some(PathBuf::from(explicit));
    }
    let config_home = env("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    let path = config_home.join(CONFIG_FILE);
    path.exists().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_under_xdg_data_home() {
        let config = Config::load_with(env_of(&[("XDG_DATA_HOME", "/data"), ("HOME", "/nonexistent")])).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/data/reunite/gallery.db"));
        assert_eq!(config.media_dir, PathBuf::from("/data/reunite/media"));
        assert_eq!(config.model_dir, PathBuf::from("/data/reunite/models"));
        assert_eq!(
            config.match_config(),
            MatchConfig {
                threshold: reunite_models::recommended_threshold(DistanceMetric::Euclidean),
                ..MatchConfig::default()
            }
        );
        assert_eq!(config.query_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_image_bytes, 10 * 1024 * 1024);
        assert_eq!(config.max_faces, 4);
        assert!(!config.system_bus);
    }

    #[test]
    fn test_home_fallback() {
        let config = Config::load_with(env_of(&[("HOME", "/home/ana")])).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/home/ana/.local/share/reunite/gallery.db"));
    }

    #[test]
    fn test_file_then_env_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reunited.toml");
        std::fs::write(
            &path,
            "match_threshold = 0.6\nmatch_policy = \"best_match\"\nmax_faces = 2\ndb_path = \"/srv/gallery.db\"\n",
        )
        .unwrap();
        let path_str = path.to_string_lossy().into_owned();

        let config = Config::load_with(env_of(&[
            ("HOME", "/nonexistent"),
            ("REUNITE_CONFIG", &path_str),
            ("REUNITE_MATCH_THRESHOLD", "0.45"),
            ("REUNITE_DISTANCE_METRIC", "cosine"),
        ]))
        .unwrap();

        assert_eq!(config.match_threshold, Some(0.45));
        assert_eq!(config.match_config().threshold, 0.45);
        assert_eq!(config.match_policy, MatchPolicy::BestMatch);
        assert_eq!(config.distance_metric, DistanceMetric::Cosine);
        assert_eq!(config.max_faces, 2);
        assert_eq!(config.db_path, PathBuf::from("/srv/gallery.db"));
    }

    #[test]
    fn test_xdg_config_file_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let xdg = dir.path().to_string_lossy().into_owned();
        let config = Config::load_with(env_of(&[("HOME", "/nonexistent"), ("XDG_CONFIG_HOME", &xdg)])).unwrap();
        assert_eq!(config.match_threshold, None);

        std::fs::create_dir_all(dir.path().join("reunite")).unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "system_bus = true\n").unwrap();
        let config = Config::load_with(env_of(&[("HOME", "/nonexistent"), ("XDG_CONFIG_HOME", &xdg)])).unwrap();
        assert!(config.system_bus);
    }

    #[test]
    fn test_unset_threshold_follows_metric() {
        let euclidean = Config::load_with(env_of(&[("HOME", "/nonexistent")])).unwrap();
        let threshold = euclidean.match_config().threshold;
        assert!((threshold - 1.0954).abs() < 1e-3, "{threshold}");

        let cosine =
            Config::load_with(env_of(&[("HOME", "/nonexistent"), ("REUNITE_DISTANCE_METRIC", "cosine")])).unwrap();
        assert!((cosine.match_config().threshold - 0.6).abs() < 1e-6);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reunited.toml");
        std::fs::write(&path, "match_threshold = 0.8
").unwrap();
        let path_str = path.to_string_lossy().into_owned();
        let explicit = Config::load_with(env_of(&[
            ("HOME", "/nonexistent"),
            ("REUNITE_CONFIG", &path_str),
            ("REUNITE_DISTANCE_METRIC", "cosine"),
        ]))
        .unwrap();
        assert_eq!(explicit.match_config().threshold, 0.8);
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let err = Config::load_with(env_of(&[("REUNITE_CONFIG", "/nonexistent/reunited.toml")])).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_unknown_file_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reunited.toml");
        std::fs::write(&path, "similarity_threshold = 0.4\n").unwrap();
        let path_str = path.to_string_lossy().into_owned();
        let err = Config::load_with(env_of(&[("REUNITE_CONFIG", &path_str)])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_invalid_env_values() {
        for (key, value) in [
            ("REUNITE_MATCH_THRESHOLD", "close"),
            ("REUNITE_MATCH_POLICY", "first"),
            ("REUNITE_SYSTEM_BUS", "maybe"),
        ] {
            let err = Config::load_with(env_of(&[("HOME", "/nonexistent"), (key, value)])).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidEnv { key: k, .. } if k == key), "{key}");
        }
    }

    #[test]
    fn test_env_bool() {
        let config = Config::load_with(env_of(&[("HOME", "/nonexistent"), ("REUNITE_SYSTEM_BUS", "1")])).unwrap();
        assert!(config.system_bus);
    }
}
