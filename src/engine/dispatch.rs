//! `ExperienceEngine`: the single entry point used by the upstream chat layer.
//!
//! One call to [`ExperienceEngine::handle_message`] classifies the message,
//! bootstraps the player on first contact, runs the command and applies its
//! mutations. Errors never escape as `Err`; they come back as a
//! [`MessageResponse`] carrying a stable `error.kind`.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::Value;

use crate::config::Config;
use crate::engine::admin::AdminHandlers;
use crate::engine::bootstrap::BootstrapService;
use crate::engine::errors::EngineError;
use crate::engine::execution::{Command, ExecutionContext};
use crate::engine::intent::{commands_valid_here, Intent, IntentResolver};
use crate::engine::interpreter::Interpreter;
use crate::engine::merge::{ApplyReport, MergeEngine};
use crate::engine::registry::{CommandRegistry, CommandSet, RegistryHandle};
use crate::engine::storage::{AuditEntry, StateStore, StateStoreBuilder};
use crate::engine::template::ExperienceCatalog;
use crate::engine::types::{
    effective_document, CommandDefinition, ExperienceConfig, MessageResponse, PlayerView, StateModel, WorldState,
    LOCATIONS_SECTION, PLAYER_SECTION,
};
use crate::logutil::escape_log;
use crate::metrics;
use crate::validation::{sanitize_message, validate_player_id};

/// Runtime knobs, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub admin_prefix: String,
    pub default_experience: Option<String>,
    pub interpreter_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            admin_prefix: "@".to_string(),
            default_experience: None,
            interpreter_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            admin_prefix: config.engine.admin_prefix.clone(),
            default_experience: config.engine.default_experience().map(str::to_string),
            interpreter_timeout: config.llm.timeout(),
        }
    }
}

/// One command invocation within a bound experience.
struct Invocation<'a> {
    player_id: &'a str,
    cfg: &'a ExperienceConfig,
    set: &'a CommandSet,
    message: &'a str,
    verb: &'a str,
    args: &'a str,
    is_admin: bool,
}

pub struct ExperienceEngine {
    catalog: ExperienceCatalog,
    registry: CommandRegistry,
    store: StateStore,
    bootstrap: BootstrapService,
    merge: MergeEngine,
    resolver: IntentResolver,
    admin_handlers: AdminHandlers,
    interpreter: Arc<dyn Interpreter>,
    options: EngineOptions,
}

impl ExperienceEngine {
    pub fn new(
        catalog: ExperienceCatalog,
        store: StateStore,
        interpreter: Arc<dyn Interpreter>,
        options: EngineOptions,
    ) -> Self {
        Self {
            catalog,
            registry: CommandRegistry::new(),
            bootstrap: BootstrapService::new(store.clone()),
            merge: MergeEngine::new(store.clone()),
            store,
            resolver: IntentResolver::new(&options.admin_prefix),
            admin_handlers: AdminHandlers::builtin(),
            interpreter,
            options,
        }
    }

    /// Open the catalog and state store named by `config`.
    pub fn from_config(config: &Config, interpreter: Arc<dyn Interpreter>) -> Result<Self, EngineError> {
        let catalog = ExperienceCatalog::load(&config.engine.content_root)?;
        let store = StateStoreBuilder::new(&config.engine.data_dir).open()?;
        Ok(Self::new(catalog, store, interpreter, EngineOptions::from_config(config)))
    }

    pub fn catalog(&self) -> &ExperienceCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Scan one experience's command directories, replacing its cached registry.
    pub fn discover(&self, experience_id: &str) -> Result<RegistryHandle, EngineError> {
        let cfg = self.catalog.get(experience_id)?;
        self.registry.discover(&cfg)
    }

    /// Run discovery for every configured experience.
    pub fn discover_all(&self) -> Vec<(String, Result<RegistryHandle, EngineError>)> {
        self.catalog
            .list()
            .into_iter()
            .map(|cfg| (cfg.id.clone(), self.registry.discover(&cfg)))
            .collect()
    }

    /// Re-read an experience's config and rebuild its command registry if any
    /// command file changed since the last scan.
    pub fn reload_experience(&self, experience_id: &str) -> Result<RegistryHandle, EngineError> {
        let cfg = self.catalog.reload_experience(experience_id)?;
        let (set, changed) = self.registry.refresh_if_changed(&cfg)?;
        info!(
            "Reloaded experience '{}' (commands {})",
            cfg.id,
            if changed { "rediscovered" } else { "unchanged" }
        );
        Ok(set)
    }

    /// Bootstrap a player into an experience without running a command.
    pub fn ensure_player(&self, player_id: &str, experience_id: &str) -> Result<PlayerView, EngineError> {
        let cfg = self.catalog.get(experience_id)?;
        self.bootstrap.ensure_player(player_id, &cfg)
    }

    /// The document `player_id` currently sees in `experience_id`.
    pub fn player_document(&self, player_id: &str, experience_id: &str) -> Result<Value, EngineError> {
        let cfg = self.catalog.get(experience_id)?;
        let view = self
            .store
            .get_player(player_id, &cfg.id)?
            .ok_or_else(|| EngineError::NotFound(format!("player view: {}/{}", cfg.id, player_id)))?;
        let world = self.world_for(&cfg)?;
        Ok(effective_document(&view, world.as_ref()))
    }

    pub async fn handle_message(
        &self,
        player_id: &str,
        experience_id: Option<&str>,
        message: &str,
        is_admin_capable: bool,
    ) -> MessageResponse {
        let message = sanitize_message(message);
        let bound = experience_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .or_else(|| self.options.default_experience.clone());

        if let Err(e) = validate_player_id(player_id) {
            let err = EngineError::Config(format!("player id: {}", e));
            return self.error_response(&err, bound, &message);
        }

        match self.dispatch(player_id, bound.as_deref(), &message, is_admin_capable).await {
            Ok(response) => response,
            Err(e) => self.error_response(&e, bound, &message),
        }
    }

    async fn dispatch(
        &self,
        player_id: &str,
        bound: Option<&str>,
        message: &str,
        is_admin: bool,
    ) -> Result<MessageResponse, EngineError> {
        // A stale binding must not block "play <other experience>".
        let (bound, bound_error) = match bound.map(|id| self.bind(id)) {
            Some(Ok(pair)) => (Some(pair), None),
            Some(Err(e)) => (None, Some(e)),
            None => (None, None),
        };
        let experiences = self.catalog.list();
        let intent = self
            .resolver
            .classify(message, &experiences, bound.as_ref().map(|(_, set)| set.as_ref()));
        metrics::record_intent(intent.label());
        debug!(
            "Intent for {}: {} <- \"{}\"",
            escape_log(player_id),
            intent.label(),
            escape_log(message)
        );

        match intent {
            Intent::ExperienceSelect { experience_id } => Ok(self.enter_experience(player_id, &experience_id, is_admin)),
            Intent::AdminCommand { command, verb, args } => {
                if !is_admin {
                    return Ok(self.forbidden(player_id, bound.as_ref().map(|(cfg, _)| cfg.id.as_str()), &verb, message));
                }
                let Some((cfg, set)) = bound.as_ref() else {
                    return unbound(bound_error, &experiences);
                };
                let inv = Invocation {
                    player_id,
                    cfg,
                    set,
                    message,
                    verb: &verb,
                    args: &args,
                    is_admin,
                };
                self.run_admin(&inv, command).await
            }
            Intent::PlayerCommand { command, verb, args } => {
                let Some((cfg, set)) = bound.as_ref() else {
                    return unbound(bound_error, &experiences);
                };
                if command.requires_admin && !is_admin {
                    return Ok(self.forbidden(player_id, Some(cfg.id.as_str()), &verb, message));
                }
                let inv = Invocation {
                    player_id,
                    cfg,
                    set,
                    message,
                    verb: &verb,
                    args: &args,
                    is_admin,
                };
                self.run_player(&inv, command).await
            }
            Intent::Unrecognized { token, admin_prefixed } => {
                let token = token.unwrap_or_default();
                if admin_prefixed && !is_admin {
                    return Ok(self.forbidden(player_id, bound.as_ref().map(|(cfg, _)| cfg.id.as_str()), &token, message));
                }
                let Some((cfg, set)) = bound.as_ref() else {
                    return unbound(bound_error, &experiences);
                };
                if admin_prefixed {
                    let known: Vec<&str> = set.admin_commands().map(|c| c.name.as_str()).collect();
                    return Err(EngineError::execution_failed(
                        message,
                        format!("no admin command '{}' (known: {})", token, known.join(", ")),
                    ));
                }
                let view = self.bootstrap.ensure_player(player_id, cfg)?;
                let world = self.world_for(cfg)?;
                let actions = actions_here(set, &view, world.as_ref(), is_admin);
                let opener = if token.is_empty() {
                    "I didn't catch that.".to_string()
                } else {
                    format!("I didn't understand \"{}\".", token)
                };
                let narrative = if actions.is_empty() {
                    opener
                } else {
                    format!("{} You can: {}.", opener, actions.join(", "))
                };
                Ok(MessageResponse::ok(narrative, actions, Some(cfg.id.clone())))
            }
        }
    }

    fn bind(&self, experience_id: &str) -> Result<(Arc<ExperienceConfig>, RegistryHandle), EngineError> {
        let cfg = self.catalog.get(experience_id)?;
        let set = self.commands_for(&cfg)?;
        Ok((cfg, set))
    }

    fn commands_for(&self, cfg: &ExperienceConfig) -> Result<RegistryHandle, EngineError> {
        match self.registry.handle(&cfg.id) {
            Some(set) => Ok(set),
            None => self.registry.discover(cfg),
        }
    }

    fn world_for(&self, cfg: &ExperienceConfig) -> Result<Option<WorldState>, EngineError> {
        match cfg.state_model {
            StateModel::Shared => self.store.get_world(&cfg.id),
            StateModel::Isolated => Ok(None),
        }
    }

    /// Bind the conversation to a new experience and describe where the player stands.
    fn enter_experience(&self, player_id: &str, experience_id: &str, is_admin: bool) -> MessageResponse {
        let entered = (|| {
            let cfg = self.catalog.get(experience_id)?;
            let set = self.commands_for(&cfg)?;
            let view = self.bootstrap.ensure_player(player_id, &cfg)?;
            let world = self.world_for(&cfg)?;
            Ok::<_, EngineError>((cfg, set, view, world))
        })();
        match entered {
            Ok((cfg, set, view, world)) => {
                let document = effective_document(&view, world.as_ref());
                let mut narrative = format!("Welcome to {}.", cfg.name);
                if let Some(place) = describe_location(&document) {
                    narrative.push(' ');
                    narrative.push_str(&place);
                }
                info!("{} entered {}", escape_log(player_id), cfg.id);
                let actions = actions_here(&set, &view, world.as_ref(), is_admin);
                MessageResponse::ok(narrative, actions, Some(cfg.id.clone()))
            }
            Err(e) => self.error_response(&e, Some(experience_id.to_string()), experience_id),
        }
    }

    async fn run_player(&self, inv: &Invocation<'_>, command: Arc<CommandDefinition>) -> Result<MessageResponse, EngineError> {
        let view = self.bootstrap.ensure_player(inv.player_id, inv.cfg)?;
        let world = self.world_for(inv.cfg)?;
        if let Some(response) = check_prerequisites(inv, &command, &view, world.as_ref()) {
            return Ok(response);
        }
        let command = Command::interpreted(command);
        let (response, report) = self.run_command(inv, &command, &view, world.as_ref()).await?;
        debug!(
            "{} in {}: {} applied, {} dropped",
            command.definition().name,
            inv.cfg.id,
            report.applied_count(),
            report.dropped_count()
        );
        Ok(response)
    }

    async fn run_admin(&self, inv: &Invocation<'_>, command: Arc<CommandDefinition>) -> Result<MessageResponse, EngineError> {
        let mut audit = AuditEntry::new(&inv.cfg.id, inv.player_id, &command.name, inv.args);
        let result = async {
            let compiled = Command::compiled(command, &self.admin_handlers)?;
            let view = self.bootstrap.ensure_player(inv.player_id, inv.cfg)?;
            let world = self.world_for(inv.cfg)?;
            self.run_command(inv, &compiled, &view, world.as_ref()).await
        }
        .await;

        if let Ok((_, report)) = &result {
            audit.applied = report.applied_count();
            audit.dropped = report.dropped_count();
            audit.succeeded = true;
        }
        info!(
            "Admin @{} by {} in {} ({}): {} applied, {} dropped",
            audit.command,
            escape_log(inv.player_id),
            inv.cfg.id,
            if audit.succeeded { "ok" } else { "failed" },
            audit.applied,
            audit.dropped
        );
        if let Err(e) = self.store.append_audit(&audit) {
            warn!("Failed to record admin audit entry: {}", e);
        }
        result.map(|(response, _)| response)
    }

    async fn run_command(
        &self,
        inv: &Invocation<'_>,
        command: &Command,
        view: &PlayerView,
        world: Option<&WorldState>,
    ) -> Result<(MessageResponse, ApplyReport), EngineError> {
        let ctx = ExecutionContext {
            experience: inv.cfg,
            player_id: inv.player_id,
            message: inv.message,
            verb: inv.verb,
            args: inv.args,
            view,
            world,
            interpreter: self.interpreter.as_ref(),
            timeout: self.options.interpreter_timeout,
        };
        let outcome = command.execute(&ctx).await?;

        let mut report = ApplyReport::default();
        for rejected in outcome.rejected {
            report.record_drop(rejected.mutation, rejected.reason);
        }
        if !report.dropped.is_empty() {
            metrics::record_apply(0, report.dropped_count());
        }

        let proposed = outcome.mutations.len();
        let fresh_view = if outcome.reset_player {
            self.bootstrap.reset_player(inv.player_id, inv.cfg).await?
        } else {
            report.merge(self.merge.apply(inv.player_id, inv.cfg, outcome.mutations).await?);
            self.store
                .get_player(inv.player_id, &inv.cfg.id)?
                .ok_or_else(|| EngineError::NotFound(format!("player view: {}/{}", inv.cfg.id, inv.player_id)))?
        };
        let fresh_world = self.world_for(inv.cfg)?;

        let actions = if outcome.available_actions.is_empty() {
            actions_here(inv.set, &fresh_view, fresh_world.as_ref(), inv.is_admin)
        } else {
            outcome.available_actions
        };
        let mut narrative = outcome.narrative;
        // Compiled narratives are written before the merge, so say when none of it landed.
        if matches!(command, Command::Compiled(_)) && proposed > 0 && report.applied.is_empty() {
            narrative.push_str(" (nothing changed)");
        }
        Ok((MessageResponse::ok(narrative, actions, Some(inv.cfg.id.clone())), report))
    }

    fn forbidden(&self, player_id: &str, experience_id: Option<&str>, verb: &str, message: &str) -> MessageResponse {
        warn!(
            target: "security",
            "Forbidden admin command '{}' from {} in {}",
            escape_log(verb),
            escape_log(player_id),
            experience_id.unwrap_or("-")
        );
        metrics::record_forbidden();
        let err = EngineError::Forbidden(format!("{}{} requires admin capability", self.resolver.admin_prefix(), verb));
        self.error_response(&err, experience_id.map(str::to_string), message)
    }

    fn error_response(&self, err: &EngineError, experience_id: Option<String>, message: &str) -> MessageResponse {
        if err.is_configuration() {
            error!("Configuration error handling \"{}\": {}", escape_log(message), err);
        } else {
            debug!("Error handling \"{}\": {}", escape_log(message), err);
        }
        let narrative = match err {
            EngineError::CommandExecutionFailed { message, .. } => {
                format!("Something went wrong while handling \"{}\". Please try again.", message)
            }
            EngineError::Forbidden(_) => "That command requires admin privileges.".to_string(),
            EngineError::UnknownExperience(id) => format!("There is no experience called \"{}\".", id),
            e if e.is_configuration() => "This experience is unavailable right now.".to_string(),
            _ => "Something went wrong. Please try again.".to_string(),
        };
        MessageResponse::failed(narrative, err.kind(), err.to_string(), experience_id)
    }
}

fn unbound(bound_error: Option<EngineError>, experiences: &[Arc<ExperienceConfig>]) -> Result<MessageResponse, EngineError> {
    match bound_error {
        Some(e) => Err(e),
        None => Ok(experience_required(experiences)),
    }
}

fn experience_required(experiences: &[Arc<ExperienceConfig>]) -> MessageResponse {
    let names: Vec<&str> = experiences.iter().map(|cfg| cfg.name.as_str()).collect();
    let narrative = if names.is_empty() {
        "No experiences are available.".to_string()
    } else {
        format!(
            "Which experience would you like? Say \"play <name>\". Available: {}.",
            names.join(", ")
        )
    };
    let mut response = MessageResponse::failed(
        narrative,
        EngineError::ExperienceRequired.kind(),
        EngineError::ExperienceRequired.to_string(),
        None,
    );
    response.available_actions = experiences.iter().map(|cfg| format!("play {}", cfg.id)).collect();
    response
}

fn location_record<'a>(document: &'a Value) -> (Option<&'a str>, Option<&'a Value>) {
    let id = document
        .get(PLAYER_SECTION)
        .and_then(|p| p.get("current_location"))
        .and_then(Value::as_str);
    let record = id.and_then(|id| document.get(LOCATIONS_SECTION)?.get(id));
    (id, record)
}

fn actions_here(set: &CommandSet, view: &PlayerView, world: Option<&WorldState>, is_admin: bool) -> Vec<String> {
    let document = effective_document(view, world);
    let (id, record) = location_record(&document);
    commands_valid_here(set, record, id.is_some(), is_admin)
}

fn describe_location(document: &Value) -> Option<String> {
    let (id, record) = location_record(document);
    let id = id?;
    let record = record?;
    let name = record.get("name").and_then(Value::as_str).unwrap_or(id);
    Some(match record.get("description").and_then(Value::as_str) {
        Some(description) => format!("{}: {}", name, description),
        None => name.to_string(),
    })
}

/// Cheap deterministic checks made before spending an interpreter call.
fn check_prerequisites(
    inv: &Invocation<'_>,
    command: &CommandDefinition,
    view: &PlayerView,
    world: Option<&WorldState>,
) -> Option<MessageResponse> {
    let document = effective_document(view, world);
    let (location, record) = location_record(&document);
    let reply = |narrative: String| {
        let actions = commands_valid_here(inv.set, record, location.is_some(), inv.is_admin);
        Some(MessageResponse::ok(narrative, actions, Some(inv.cfg.id.clone())))
    };

    if command.requires_location && location.is_none() {
        return reply("You need to be somewhere to do that.".to_string());
    }
    let listed = record
        .and_then(|r| r.get("available_commands"))
        .and_then(Value::as_array);
    if let Some(listed) = listed {
        let here = listed
            .iter()
            .filter_map(Value::as_str)
            .any(|name| name.eq_ignore_ascii_case(&command.name));
        if !here {
            return reply(format!("You can't {} here.", inv.verb));
        }
    }
    if command.requires_target && inv.args.trim().is_empty() {
        return reply(format!("What do you want to {}?", inv.verb));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn experience_required_lists_choices() {
        let experiences = vec![
            Arc::new(ExperienceConfig::new("woods", "The Woods", StateModel::Isolated, "/tmp")),
            Arc::new(ExperienceConfig::new("shop", "Dream Shop", StateModel::Shared, "/tmp")),
        ];
        let response = experience_required(&experiences);
        assert_eq!(response.error.as_ref().map(|e| e.kind.as_str()), Some("experience_required"));
        assert!(response.narrative.contains("The Woods"));
        assert_eq!(response.available_actions, vec!["play woods", "play shop"]);
        assert!(response.experience_id.is_none());
    }

    #[test]
    fn location_description_uses_name_and_text() {
        let document = serde_json::json!({
            "player": {"current_location": "counter"},
            "locations": {"counter": {"name": "The Counter", "description": "Bottles everywhere."}}
        });
        assert_eq!(
            describe_location(&document).as_deref(),
            Some("The Counter: Bottles everywhere.")
        );
        assert_eq!(describe_location(&serde_json::json!({})), None);
    }
}
