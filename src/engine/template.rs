//! Template Store: read-only access to experience configs and world templates.
//!
//! Each experience lives in its own directory under the content root:
//!
//! ```text
//! experiences/
//!   wylding-woods/
//!     experience.toml
//!     world.json
//!     game-logic/*.md
//!     admin-logic/*.md
//! ```
//!
//! Configs are loaded once and cached; [`ExperienceCatalog::reload`] is the only
//! way to pick up changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::{debug, info, warn};
use serde_json::Value;

use crate::engine::errors::EngineError;
use crate::engine::types::{display_path, ExperienceConfig, LOCATIONS_SECTION};
use crate::logutil::escape_log;
use crate::validation::validate_identifier;

pub const EXPERIENCE_CONFIG_FILE: &str = "experience.toml";

/// Cached index of every experience found under the content root.
pub struct ExperienceCatalog {
    root: PathBuf,
    experiences: RwLock<BTreeMap<String, Arc<ExperienceConfig>>>,
}

impl ExperienceCatalog {
    /// Scan `root` for experience directories. Directories without a config are ignored;
    /// directories whose config fails to parse are skipped with a warning.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let catalog = Self {
            root: root.into(),
            experiences: RwLock::new(BTreeMap::new()),
        };
        catalog.reload()?;
        Ok(catalog)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Re-scan the content root and atomically replace the cache.
    pub fn reload(&self) -> Result<usize, EngineError> {
        let mut found = BTreeMap::new();
        if !self.root.is_dir() {
            return Err(EngineError::Config(format!(
                "content root {} is not a directory",
                self.root.display()
            )));
        }
        let mut dirs: Vec<PathBuf> = std::fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            if !dir.join(EXPERIENCE_CONFIG_FILE).is_file() {
                continue;
            }
            match load_experience_config(&dir) {
                Ok(cfg) => {
                    if found.contains_key(&cfg.id) {
                        warn!("Duplicate experience id '{}' in {}; ignoring", cfg.id, dir.display());
                        continue;
                    }
                    debug!("Loaded experience '{}' ({}) from {}", cfg.id, cfg.state_model, dir.display());
                    found.insert(cfg.id.clone(), Arc::new(cfg));
                }
                Err(e) => warn!("Skipping experience in {}: {}", dir.display(), e),
            }
        }

        let count = found.len();
        let mut guard = self
            .experiences
            .write()
            .map_err(|_| EngineError::Internal("experience catalog poisoned".into()))?;
        *guard = found;
        info!("Experience catalog loaded {} experience(s) from {}", count, self.root.display());
        Ok(count)
    }

    /// Re-read one experience's config in place.
    pub fn reload_experience(&self, experience_id: &str) -> Result<Arc<ExperienceConfig>, EngineError> {
        let current = self.get(experience_id)?;
        let cfg = Arc::new(load_experience_config(&current.root)?);
        if cfg.id != experience_id {
            return Err(EngineError::Config(format!(
                "experience id changed from '{}' to '{}' during reload",
                experience_id, cfg.id
            )));
        }
        let mut guard = self
            .experiences
            .write()
            .map_err(|_| EngineError::Internal("experience catalog poisoned".into()))?;
        guard.insert(cfg.id.clone(), cfg.clone());
        Ok(cfg)
    }

    pub fn get(&self, experience_id: &str) -> Result<Arc<ExperienceConfig>, EngineError> {
        let guard = self
            .experiences
            .read()
            .map_err(|_| EngineError::Internal("experience catalog poisoned".into()))?;
        guard
            .get(experience_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownExperience(experience_id.to_string()))
    }

    pub fn list(&self) -> Vec<Arc<ExperienceConfig>> {
        self.experiences
            .read()
            .map(|guard| guard.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Parse `<dir>/experience.toml` and validate it.
pub fn load_experience_config(dir: &Path) -> Result<ExperienceConfig, EngineError> {
    let path = dir.join(EXPERIENCE_CONFIG_FILE);
    let content = std::fs::read_to_string(&path)?;
    let mut cfg: ExperienceConfig = toml::from_str(&content)
        .map_err(|e| EngineError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
    validate_identifier(&cfg.id)
        .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
    if cfg.template.trim().is_empty() {
        return Err(EngineError::Config(format!("{}: template path is empty", path.display())));
    }
    cfg.root = dir.to_path_buf();
    Ok(cfg)
}

/// Read and parse an experience's world template.
///
/// Any failure here (missing file, unreadable, not a JSON object) is reported as
/// `TemplateNotFound`: the experience is misconfigured and retrying will not help.
pub fn load_world_template(cfg: &ExperienceConfig) -> Result<Value, EngineError> {
    let path = cfg.template_path();
    let not_found = |why: String| {
        warn!(
            "World template for '{}' unusable ({}): {}",
            cfg.id,
            display_path(&path),
            escape_log(&why)
        );
        EngineError::TemplateNotFound {
            experience_id: cfg.id.clone(),
            path: display_path(&path),
        }
    };
    let content = std::fs::read_to_string(&path).map_err(|e| not_found(e.to_string()))?;
    let template: Value = serde_json::from_str(&content).map_err(|e| not_found(e.to_string()))?;
    if !template.is_object() {
        return Err(not_found("template root is not an object".into()));
    }
    if template.get(LOCATIONS_SECTION).is_some_and(|l| !l.is_object()) {
        return Err(not_found("`locations` must be an object".into()));
    }
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::StateModel;
    use tempfile::TempDir;

    fn write_experience(root: &Path, dir: &str, body: &str) -> PathBuf {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(EXPERIENCE_CONFIG_FILE), body).unwrap();
        path
    }

    #[test]
    fn catalog_skips_broken_configs() {
        let dir = TempDir::new().expect("tempdir");
        write_experience(
            dir.path(),
            "woods",
            "id = \"woods\"\nname = \"Woods\"\nstate_model = \"isolated\"\ntemplate = \"world.json\"\n",
        );
        write_experience(dir.path(), "broken", "id = 5\n");
        std::fs::create_dir_all(dir.path().join("not-an-experience")).unwrap();

        let catalog = ExperienceCatalog::load(dir.path()).expect("catalog");
        assert_eq!(catalog.list().len(), 1);
        let woods = catalog.get("woods").expect("woods");
        assert_eq!(woods.state_model, StateModel::Isolated);
        assert_eq!(woods.game_logic_dir, "game-logic");
        assert!(matches!(
            catalog.get("broken"),
            Err(EngineError::UnknownExperience(_))
        ));
    }

    #[test]
    fn missing_template_is_template_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let root = write_experience(
            dir.path(),
            "west",
            "id = \"west\"\nname = \"West of House\"\nstate_model = \"shared\"\ntemplate = \"nope.json\"\n",
        );
        let cfg = load_experience_config(&root).expect("config");
        let err = load_world_template(&cfg).unwrap_err();
        assert_eq!(err.kind(), "template_not_found");

        std::fs::write(root.join("nope.json"), "[1, 2]").unwrap();
        assert_eq!(load_world_template(&cfg).unwrap_err().kind(), "template_not_found");

        std::fs::write(root.join("nope.json"), r#"{"locations": {"a": {}}}"#).unwrap();
        assert!(load_world_template(&cfg).is_ok());
    }

    #[test]
    fn invalid_ids_are_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let root = write_experience(
            dir.path(),
            "bad",
            "id = \"../escape\"\nname = \"Bad\"\nstate_model = \"shared\"\ntemplate = \"world.json\"\n",
        );
        assert!(matches!(load_experience_config(&root), Err(EngineError::Config(_))));
    }
}
