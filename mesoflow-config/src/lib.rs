use mesoflow_checkpoint::CheckpointPolicy;
use mesoflow_core::reserved;
use mesoflow_core::{ElementType, EntityKind};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::{fs, io};
use thiserror::Error;

// --- Error Type ---
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] io::Error),

    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Validation(String),
}

// --- Configuration Sections ---

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct DomainSettings {
    pub global_size: [f32; 3],
    /// Origin of the periodic box.
    #[serde(default)]
    pub global_start: [f32; 3],
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExportSettings {
    pub every: u64,
    pub folder: PathBuf,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub element_type: ElementType,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default = "default_exchange")]
    pub exchange: bool,
}

fn default_exchange() -> bool { true }

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CollectionConfig {
    pub name: String,
    pub kind: EntityKind,
    pub count: usize,
    #[serde(default = "default_mass")]
    pub mass: f32,
    /// Extra reserved channels beyond the defaults of `kind`.
    #[serde(default)]
    pub reserved: Vec<String>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

fn default_mass() -> f32 { 1.0 }

// --- Top-Level Config Struct ---

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub domain: DomainSettings,
    pub dt: f32,
    pub steps: u64,
    #[serde(default = "default_ranks")]
    pub ranks: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Amplitude of random force kicks; 0 disables forcing.
    #[serde(default)]
    pub forcing: f32,
    #[serde(default)]
    pub checkpoint: CheckpointPolicy,
    #[serde(default)]
    pub export: Option<ExportSettings>,
    pub collections: Vec<CollectionConfig>,
}

fn default_ranks() -> usize { 1 }

// --- Loading Function ---

/// Load and validate a config. Files ending in `.toml` are parsed as TOML,
/// everything else as JSON.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: Config = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content)?,
        _ => serde_json::from_str(&content)?,
    };
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<(), ConfigError> {
    let invalid = |message: String| Err(ConfigError::Validation(message));

    if !(config.dt.is_finite() && config.dt > 0.0) {
        return invalid(format!("dt must be positive, got {}", config.dt));
    }
    if config.domain.global_size.iter().any(|&s| !(s.is_finite() && s > 0.0)) {
        return invalid(format!("domain extents must be positive, got {:?}", config.domain.global_size));
    }
    if config.ranks == 0 {
        return invalid("ranks cannot be zero".to_string());
    }
    if config.checkpoint.is_enabled() && config.checkpoint.folder.as_os_str().is_empty() {
        return invalid("checkpoint folder cannot be empty".to_string());
    }
    if let Some(export) = &config.export {
        if export.every == 0 || export.folder.as_os_str().is_empty() {
            return invalid("export needs a positive 'every' and a folder".to_string());
        }
    }

    let mut names = HashSet::new();
    for collection in &config.collections {
        if !names.insert(collection.name.as_str()) {
            return invalid(format!("duplicate collection '{}'", collection.name));
        }
        validate_collection(collection)?;
    }
    Ok(())
}

fn validate_collection(collection: &CollectionConfig) -> Result<(), ConfigError> {
    let name = &collection.name;
    let invalid = |message: String| Err(ConfigError::Validation(format!("collection '{name}': {message}")));

    if name.is_empty() || name.contains(['/', '\\', '.']) {
        return invalid("name must be non-empty and must not contain '/', '\\' or '.'".to_string());
    }
    if collection.kind == EntityKind::Bisegments {
        return invalid("bisegment collections cannot be simulated on their own".to_string());
    }
    if !(collection.mass.is_finite() && collection.mass > 0.0) {
        return invalid(format!("mass must be positive, got {}", collection.mass));
    }
    for field in &collection.reserved {
        match reserved::lookup(field) {
            None => return invalid(format!("'{field}' is not a reserved channel")),
            Some(f) if !f.applies_to(collection.kind) => {
                return invalid(format!("reserved channel '{field}' does not apply to {:?}", collection.kind))
            }
            Some(_) => {}
        }
    }

    let mut channels = HashSet::new();
    for channel in &collection.channels {
        if reserved::is_reserved(&channel.name) {
            return invalid(format!("channel '{}' uses a reserved name", channel.name));
        }
        if !channels.insert(channel.name.as_str()) {
            return invalid(format!("duplicate channel '{}'", channel.name));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use mesoflow_checkpoint::CheckpointIdAdvanceMode;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const VALID: &str = r#"{
      "domain": { "global_size": [32.0, 16.0, 16.0] },
      "dt": 0.01,
      "steps": 100,
      "ranks": 2,
      "checkpoint": { "every": 10, "folder": "restart", "mode": "incremental" },
      "collections": [
        { "name": "solvent", "kind": "particles", "count": 500,
          "channels": [ { "name": "charge", "type": "float", "persistent": true } ] },
        { "name": "rigid", "kind": "objects", "count": 4, "mass": 20.0,
          "reserved": ["motions"] }
      ]
    }"#;

    fn json_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    fn load_str(content: &str) -> Result<Config, ConfigError> {
        load_config(json_file(content).path())
    }

    #[test]
    fn load_valid_json_config() {
        let config = load_str(VALID).unwrap();
        assert_eq!(config.domain.global_start, [0.0; 3]);
        assert_eq!(config.ranks, 2);
        assert_eq!(config.seed, None);
        assert_eq!(config.checkpoint.every, 10);
        assert_eq!(config.checkpoint.mode, CheckpointIdAdvanceMode::Incremental);
        assert!(config.export.is_none());

        let solvent = &config.collections[0];
        assert_eq!(solvent.kind, EntityKind::Particles);
        assert_eq!(solvent.mass, 1.0);
        assert_eq!(solvent.channels[0].element_type, ElementType::Float);
        assert!(solvent.channels[0].exchange);
        assert_eq!(config.collections[1].reserved, vec!["motions"]);
    }

    #[test]
    fn checkpointing_is_off_by_default() {
        let config = load_str(
            r#"{ "domain": { "global_size": [1, 1, 1] }, "dt": 0.1, "steps": 1, "collections": [] }"#,
        )
        .unwrap();
        assert!(!config.checkpoint.is_enabled());
        assert_eq!(config.checkpoint.mode, CheckpointIdAdvanceMode::PingPong);
        assert_eq!(config.ranks, 1);
    }

    #[test]
    fn load_toml_config() {
        let dir = assert_fs::TempDir::new().unwrap();
        let file = dir.child("run.toml");
        file.write_str(
            r#"
            dt = 0.5
            steps = 3
            seed = 42

            [domain]
            global_size = [8.0, 8.0, 8.0]
            global_start = [-4.0, -4.0, -4.0]

            [export]
            every = 1
            folder = "dumps"

            [[collections]]
            name = "pv"
            kind = "particles"
            count = 10
            channels = [{ name = "tag", type = "int", exchange = false }]
            "#,
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.domain.global_start, [-4.0; 3]);
        assert_eq!(config.export.unwrap().folder, PathBuf::from("dumps"));
        assert!(!config.collections[0].channels[0].exchange);
    }

    #[test]
    fn rejects_non_positive_dt() {
        let result = load_str(&VALID.replace("\"dt\": 0.01", "\"dt\": 0.0"));
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_reserved_user_channel() {
        let result = load_str(&VALID.replace("\"name\": \"charge\"", "\"name\": \"__positions\""));
        assert!(matches!(result, Err(ConfigError::Validation(m)) if m.contains("reserved name")));
    }

    #[test]
    fn rejects_reserved_field_of_other_kind() {
        let result = load_str(&VALID.replace("\"reserved\": [\"motions\"]", "\"reserved\": [\"__velocities\"]"));
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_duplicate_collections() {
        let result = load_str(&VALID.replace("\"name\": \"rigid\"", "\"name\": \"solvent\""));
        assert!(matches!(result, Err(ConfigError::Validation(m)) if m.contains("duplicate collection")));
    }

    #[test]
    fn rejects_zero_ranks_and_empty_domain() {
        assert!(load_str(&VALID.replace("\"ranks\": 2", "\"ranks\": 0")).is_err());
        assert!(load_str(&VALID.replace("[32.0, 16.0, 16.0]", "[32.0, 0.0, 16.0]")).is_err());
    }

    #[test]
    fn unknown_element_type_is_a_parse_error() {
        let result = load_str(&VALID.replace("\"type\": \"float\"", "\"type\": \"float7\""));
        assert!(matches!(result, Err(ConfigError::Json(_))));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = assert_fs::TempDir::new().unwrap();
        assert!(matches!(
            load_config(&dir.path().join("absent.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
