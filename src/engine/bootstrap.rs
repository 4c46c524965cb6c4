//! Bootstrap Service: first-contact creation of player records.
//!
//! Isolated experiences get a deep copy of the world template per player. Shared
//! experiences get a small overlay holding only the player section, plus the one
//! world record, created by whichever player arrives first.

use log::info;
use serde_json::{json, Value};

use crate::engine::errors::EngineError;
use crate::engine::storage::StateStore;
use crate::engine::template::load_world_template;
use crate::engine::types::{initial_player_section, ExperienceConfig, PlayerView, StateModel, WorldState, PLAYER_SECTION};
use crate::logutil::escape_log;
use crate::validation::validate_player_id;

pub struct BootstrapService {
    store: StateStore,
}

impl BootstrapService {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Return the player's record for this experience, creating it on first contact.
    /// An existing record is returned unchanged.
    pub fn ensure_player(&self, player_id: &str, cfg: &ExperienceConfig) -> Result<PlayerView, EngineError> {
        validate_player_id(player_id).map_err(|e| EngineError::Config(format!("player id: {}", e)))?;

        if let Some(existing) = self.store.get_player(player_id, &cfg.id)? {
            if cfg.state_model == StateModel::Shared && self.store.get_world(&cfg.id)?.is_none() {
                self.ensure_world(cfg)?;
            }
            return Ok(existing);
        }

        let template = load_world_template(cfg)?;
        if cfg.state_model == StateModel::Shared {
            self.create_world(cfg, &template)?;
        }
        let fresh = PlayerView::new(player_id, &cfg.id, cfg.state_model, initial_document(cfg.state_model, &template));
        let (view, created) = self.store.create_player_if_absent(&fresh)?;
        if created {
            info!(
                "Bootstrapped {} into {} ({}) at {}",
                escape_log(player_id),
                cfg.id,
                cfg.state_model,
                view.current_location().unwrap_or("<nowhere>")
            );
        }
        Ok(view)
    }

    /// Create the shared world record if it does not exist yet. Returns `true` when
    /// this call created it. No-op for isolated experiences.
    pub fn ensure_world(&self, cfg: &ExperienceConfig) -> Result<bool, EngineError> {
        if cfg.state_model != StateModel::Shared {
            return Ok(false);
        }
        if self.store.get_world(&cfg.id)?.is_some() {
            return Ok(false);
        }
        let template = load_world_template(cfg)?;
        self.create_world(cfg, &template)
    }

    fn create_world(&self, cfg: &ExperienceConfig, template: &Value) -> Result<bool, EngineError> {
        let created = self
            .store
            .create_world_if_absent(&WorldState::from_template(&cfg.id, template))?;
        if created {
            info!("Created shared world for {}", cfg.id);
        }
        Ok(created)
    }

    /// Replace the player's record with a fresh one built from the template.
    /// Keeps the record's revision counter moving forward.
    pub async fn reset_player(&self, player_id: &str, cfg: &ExperienceConfig) -> Result<PlayerView, EngineError> {
        let _guard = self.store.lock_player(player_id, &cfg.id).await?;
        let template = load_world_template(cfg)?;
        let previous_revision = self
            .store
            .get_player(player_id, &cfg.id)?
            .map(|v| v.revision)
            .unwrap_or(0);
        let mut view = PlayerView::new(player_id, &cfg.id, cfg.state_model, initial_document(cfg.state_model, &template));
        view.revision = previous_revision + 1;
        self.store.put_player(&view)?;
        info!("Reset {} in {}", escape_log(player_id), cfg.id);
        Ok(view)
    }
}

fn initial_document(model: StateModel, template: &Value) -> Value {
    let section = initial_player_section(template);
    match model {
        StateModel::Isolated => {
            let mut document = template.clone();
            if let Some(map) = document.as_object_mut() {
                map.insert(PLAYER_SECTION.to_string(), section);
            }
            document
        }
        StateModel::Shared => json!({ PLAYER_SECTION: section }),
    }
}
