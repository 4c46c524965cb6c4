//! Execution Engine: turns a resolved command into a narrative and proposed
//! state mutations.
//!
//! Two kinds of command sit behind one [`Command::execute`] entry point:
//! interpreted commands hand their markdown body plus a state slice to the
//! [`Interpreter`], compiled commands run a deterministic admin handler.
//! Neither writes state; the caller passes the resulting mutations to the merge
//! engine.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde_json::{json, Map, Value};

use crate::engine::admin::{AdminAction, AdminContext, AdminHandler, AdminHandlers};
use crate::engine::errors::EngineError;
use crate::engine::interpreter::{Interpreter, InterpreterError, InterpreterRequest};
use crate::engine::merge::DroppedMutation;
use crate::engine::types::{
    effective_document, CommandDefinition, ExperienceConfig, MutationTarget, PlayerView, StateModel, StateMutation,
    WorldState, LOCATIONS_SECTION, PLAYER_SECTION,
};
use crate::logutil::escape_log;
use crate::metrics;
use crate::validation::validate_state_path;

/// Interpreter attempts per command: the first call plus one repair retry.
pub const MAX_INTERPRETER_ATTEMPTS: u8 = 2;

const RESPONSE_CONTRACT: &str = r#"Reply with a single JSON object and nothing else:
{
  "narrative": "<what the player experiences, second person>",
  "state_updates": [
    {"target": "player" | "world", "path": "<dot.separated.path>", "operation": "append" | "remove" | "set", "payload": <json>}
  ],
  "available_actions": ["<short suggestion>", ...]
}
Paths start at the document root, e.g. "player.inventory" or "locations.<location_id>.items".
Use target "player" only for paths under "player". Use an empty list when nothing changes."#;

const REPAIR_NOTICE: &str = "Your previous reply could not be used";

/// Everything a command needs to run once.
pub struct ExecutionContext<'a> {
    pub experience: &'a ExperienceConfig,
    pub player_id: &'a str,
    /// Original player message, kept for error reporting.
    pub message: &'a str,
    pub verb: &'a str,
    pub args: &'a str,
    pub view: &'a PlayerView,
    /// Shared world record; `None` for isolated experiences.
    pub world: Option<&'a WorldState>,
    pub interpreter: &'a dyn Interpreter,
    pub timeout: Duration,
}

impl ExecutionContext<'_> {
    fn document(&self) -> Value {
        effective_document(self.view, self.world)
    }
}

/// Result of running a command. Nothing here has been applied yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutcome {
    pub narrative: String,
    pub available_actions: Vec<String>,
    pub mutations: Vec<StateMutation>,
    /// Operations rejected before reaching the merge engine.
    pub rejected: Vec<DroppedMutation>,
    /// The caller's record should be rebuilt from the template.
    pub reset_player: bool,
    /// Interpreter calls made; zero for compiled commands.
    pub attempts: u8,
}

pub struct InterpretedCommand {
    definition: Arc<CommandDefinition>,
}

pub struct CompiledCommand {
    definition: Arc<CommandDefinition>,
    handler: AdminHandler,
}

pub enum Command {
    Interpreted(InterpretedCommand),
    Compiled(CompiledCommand),
}

impl Command {
    pub fn interpreted(definition: Arc<CommandDefinition>) -> Self {
        Command::Interpreted(InterpretedCommand { definition })
    }

    /// Bind an admin definition to its handler. A definition with no handler is
    /// an execution failure, reported like any other.
    pub fn compiled(definition: Arc<CommandDefinition>, handlers: &AdminHandlers) -> Result<Self, EngineError> {
        let handler = handlers.get(&definition.name).ok_or_else(|| {
            EngineError::execution_failed(
                &definition.name,
                format!("no handler registered for admin command '{}'", definition.name),
            )
        })?;
        Ok(Command::Compiled(CompiledCommand { definition, handler }))
    }

    pub fn definition(&self) -> &CommandDefinition {
        match self {
            Command::Interpreted(c) => &c.definition,
            Command::Compiled(c) => &c.definition,
        }
    }

    pub async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<ExecutionOutcome, EngineError> {
        match self {
            Command::Interpreted(c) => c.execute(ctx).await,
            Command::Compiled(c) => c.execute(ctx),
        }
    }
}

impl CompiledCommand {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<ExecutionOutcome, EngineError> {
        let document = ctx.document();
        let admin_ctx = AdminContext {
            player_id: ctx.player_id,
            experience_id: &ctx.experience.id,
            document: &document,
            args: ctx.args,
        };
        debug!(
            "Admin handler {} for {} args={}",
            self.definition.name,
            escape_log(ctx.player_id),
            escape_log(ctx.args)
        );
        match (self.handler)(&admin_ctx)? {
            AdminAction::Apply { narrative, mutations } => Ok(ExecutionOutcome {
                narrative,
                mutations,
                ..Default::default()
            }),
            AdminAction::ResetPlayer => Ok(ExecutionOutcome {
                narrative: format!("{} has been reset to the start of {}.", ctx.player_id, ctx.experience.name),
                reset_player: true,
                ..Default::default()
            }),
        }
    }
}

impl InterpretedCommand {
    async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<ExecutionOutcome, EngineError> {
        let document = ctx.document();
        let state = state_slice(ctx.experience, &document);
        let system_prompt = build_system_prompt(ctx.experience, &self.definition);
        let user_prompt = build_user_prompt(ctx, &state);

        let mut last_error = String::new();
        for attempt in 1..=MAX_INTERPRETER_ATTEMPTS {
            let system_prompt = if attempt == 1 {
                system_prompt.clone()
            } else {
                repair_prompt(&system_prompt, &last_error)
            };
            let request = InterpreterRequest {
                experience_id: ctx.experience.id.clone(),
                player_id: ctx.player_id.to_string(),
                command: self.definition.name.clone(),
                arguments: ctx.args.to_string(),
                message: ctx.message.to_string(),
                system_prompt,
                user_prompt: user_prompt.clone(),
                state: state.clone(),
                attempt,
            };

            let outcome = call_interpreter(ctx.interpreter, &request, ctx.timeout)
                .await
                .map_err(|e| e.to_string())
                .and_then(|raw| decode_response(&raw));
            match outcome {
                Ok(decoded) => {
                    let (mutations, mut rejected) = filter_to_schema(ctx.experience.state_model, &document, decoded.mutations);
                    rejected.extend(decoded.rejected);
                    for drop in &rejected {
                        warn!(
                            "Rejected interpreter mutation for {}/{}: {} ({})",
                            ctx.experience.id,
                            escape_log(ctx.player_id),
                            escape_log(&drop.mutation.to_string()),
                            drop.reason
                        );
                    }
                    return Ok(ExecutionOutcome {
                        narrative: decoded.narrative,
                        available_actions: decoded.available_actions,
                        mutations,
                        rejected,
                        reset_player: false,
                        attempts: attempt,
                    });
                }
                Err(reason) => {
                    warn!(
                        "Interpreter attempt {}/{} failed for {} in {}: {}",
                        attempt,
                        MAX_INTERPRETER_ATTEMPTS,
                        self.definition.name,
                        ctx.experience.id,
                        escape_log(&reason)
                    );
                    last_error = reason;
                    if attempt < MAX_INTERPRETER_ATTEMPTS {
                        metrics::record_llm_retry();
                    }
                }
            }
        }

        metrics::record_llm_failure();
        Err(EngineError::execution_failed(ctx.message, last_error))
    }
}

async fn call_interpreter(
    interpreter: &dyn Interpreter,
    request: &InterpreterRequest,
    timeout: Duration,
) -> Result<String, InterpreterError> {
    match tokio::time::timeout(timeout, interpreter.interpret(request)).await {
        Ok(result) => result,
        Err(_) => Err(InterpreterError::Timeout(timeout.as_secs())),
    }
}

/// Bounded view of the player's world handed to the interpreter.
pub fn state_slice(experience: &ExperienceConfig, document: &Value) -> Value {
    let player = document.get(PLAYER_SECTION).cloned().unwrap_or(Value::Null);
    let location_id = player.get("current_location").and_then(Value::as_str).map(str::to_string);
    let locations = document.get(LOCATIONS_SECTION).and_then(Value::as_object);

    let mut location = Map::new();
    if let Some(id) = &location_id {
        location.insert("id".into(), Value::String(id.clone()));
        if let Some(Value::Object(record)) = locations.and_then(|l| l.get(id)) {
            for (key, value) in record {
                location.insert(key.clone(), value.clone());
            }
        }
    }

    let npcs_here: Vec<Value> = match (document.get("npcs"), &location_id) {
        (Some(Value::Object(npcs)), Some(here)) => npcs
            .iter()
            .filter(|(_, npc)| npc.get("location").and_then(Value::as_str) == Some(here.as_str()))
            .map(|(id, npc)| json!({"id": id, "record": npc}))
            .collect(),
        _ => Vec::new(),
    };

    let location_ids: Vec<&String> = locations.map(|l| l.keys().collect()).unwrap_or_default();
    let mut slice = json!({
        "experience": {
            "id": experience.id,
            "name": experience.name,
            "state_model": experience.state_model.to_string(),
        },
        "player": player,
        "location": Value::Object(location),
        "location_ids": location_ids,
        "npcs_here": npcs_here,
    });
    if let (Some(flags), Some(map)) = (document.get("flags"), slice.as_object_mut()) {
        map.insert("flags".into(), flags.clone());
    }
    slice
}

fn build_system_prompt(experience: &ExperienceConfig, definition: &CommandDefinition) -> String {
    let world_note = match experience.state_model {
        StateModel::Shared => "The world is shared with other players; world changes are visible to everyone.",
        StateModel::Isolated => "The world belongs to this player alone.",
    };
    format!(
        "You are the game engine for \"{}\". {}\n\nCommand: {}\n{}\n\n{}\n\n{}",
        experience.name,
        world_note,
        definition.name,
        definition.description,
        definition.body.trim(),
        RESPONSE_CONTRACT
    )
}

fn build_user_prompt(ctx: &ExecutionContext<'_>, state: &Value) -> String {
    let state_text = serde_json::to_string_pretty(state).unwrap_or_else(|_| state.to_string());
    format!(
        "Player message: {}\nVerb: {}\nArguments: {}\n\nCurrent state:\n{}",
        ctx.message, ctx.verb, ctx.args, state_text
    )
}

fn repair_prompt(system_prompt: &str, reason: &str) -> String {
    format!(
        "{}\n\n{} ({}). Respond with ONLY the JSON object described above: no prose, no code fences, all three fields present.",
        system_prompt, REPAIR_NOTICE, reason
    )
}

/// Interpreter reply after strict decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedResponse {
    pub narrative: String,
    pub mutations: Vec<StateMutation>,
    pub available_actions: Vec<String>,
    /// Entries of `state_updates` that were not valid operations.
    pub rejected: Vec<DroppedMutation>,
}

/// Pull the JSON object out of a reply, tolerating code fences and leading chatter.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Decode an interpreter reply. A reply missing any of the three top-level fields
/// is malformed; individual bad entries in `state_updates` are rejected on their own.
pub fn decode_response(raw: &str) -> Result<DecodedResponse, String> {
    let body = extract_json_object(raw).ok_or_else(|| "reply contains no JSON object".to_string())?;
    let value: Value = serde_json::from_str(body).map_err(|e| format!("invalid JSON: {}", e))?;
    let Value::Object(mut fields) = value else {
        return Err("reply is not a JSON object".to_string());
    };

    let narrative = match fields.remove("narrative") {
        Some(Value::String(text)) => text,
        Some(_) => return Err("`narrative` must be a string".to_string()),
        None => return Err("missing `narrative`".to_string()),
    };
    let updates = match fields.remove("state_updates") {
        Some(Value::Array(items)) => items,
        Some(_) => return Err("`state_updates` must be a list".to_string()),
        None => return Err("missing `state_updates`".to_string()),
    };
    let available_actions = match fields.remove("available_actions") {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(_) => return Err("`available_actions` must be a list".to_string()),
        None => return Err("missing `available_actions`".to_string()),
    };

    let mut mutations = Vec::new();
    let mut rejected = Vec::new();
    for item in updates {
        match serde_json::from_value::<StateMutation>(item.clone()) {
            Ok(op) => mutations.push(op),
            Err(e) => rejected.push(DroppedMutation {
                mutation: placeholder_for(&item),
                reason: format!("not a valid operation: {}", e),
            }),
        }
    }

    Ok(DecodedResponse {
        narrative,
        mutations,
        available_actions,
        rejected,
    })
}

/// Best-effort record of an undecodable operation, for the apply report.
fn placeholder_for(item: &Value) -> StateMutation {
    let target = match item.get("target").and_then(Value::as_str) {
        Some("world") => MutationTarget::World,
        _ => MutationTarget::Player,
    };
    let path = item.get("path").and_then(Value::as_str).unwrap_or("<invalid>");
    StateMutation::set(target, path, item.clone())
}

/// Drop operations whose path falls outside what the target may address.
pub fn filter_to_schema(
    model: StateModel,
    document: &Value,
    mutations: Vec<StateMutation>,
) -> (Vec<StateMutation>, Vec<DroppedMutation>) {
    let mut kept = Vec::new();
    let mut rejected = Vec::new();
    for op in mutations {
        match schema_check(model, document, &op) {
            Ok(()) => kept.push(op),
            Err(reason) => rejected.push(DroppedMutation { mutation: op, reason }),
        }
    }
    (kept, rejected)
}

fn schema_check(model: StateModel, document: &Value, op: &StateMutation) -> Result<(), String> {
    validate_state_path(&op.path).map_err(|e| format!("bad path {}: {}", op.path, e))?;
    let segments = op.segments();
    let root = segments.first().copied().unwrap_or_default();
    let known = document.get(root).is_some();
    match (op.target, model) {
        (MutationTarget::Player, StateModel::Shared) if root != PLAYER_SECTION => {
            Err(format!("{} is outside the player section", op.path))
        }
        (MutationTarget::World, _) if root == PLAYER_SECTION => {
            Err(format!("{} belongs to the player, not the world", op.path))
        }
        _ if !known => Err(format!("{} is not part of this experience's state", op.path)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_fenced_reply_and_rejects_bad_entries() {
        let raw = "Sure!\n```json\n{\"narrative\": \"You take it.\", \"state_updates\": [\
            {\"target\": \"player\", \"path\": \"player.inventory\", \"operation\": \"append\", \"payload\": \"lamp\"},\
            {\"target\": \"moon\", \"path\": \"x\", \"operation\": \"explode\"}\
            ], \"available_actions\": [\"look\", 3]}\n```";
        let decoded = decode_response(raw).expect("decodes");
        assert_eq!(decoded.narrative, "You take it.");
        assert_eq!(decoded.mutations.len(), 1);
        assert_eq!(decoded.rejected.len(), 1);
        assert_eq!(decoded.available_actions, vec!["look".to_string()]);
    }

    #[test]
    fn missing_fields_are_malformed() {
        assert!(decode_response("not json at all").is_err());
        assert!(decode_response("{\"narrative\": \"hi\"}").is_err());
        assert!(decode_response("{\"narrative\": 1, \"state_updates\": [], \"available_actions\": []}").is_err());
        assert!(decode_response("{\"narrative\": \"ok\", \"state_updates\": [], \"available_actions\": []}").is_ok());
    }

    #[test]
    fn schema_filter_respects_state_model() {
        let document = json!({"player": {"inventory": []}, "locations": {"hall": {"items": []}}});
        let ops = vec![
            StateMutation::append(MutationTarget::Player, "player.inventory", json!("lamp")),
            StateMutation::remove(MutationTarget::Player, "locations.hall.items", json!("lamp")),
            StateMutation::set(MutationTarget::World, "weather.today", json!("rain")),
            StateMutation::append(MutationTarget::World, "player.inventory", json!("lamp")),
        ];
        let (kept, rejected) = filter_to_schema(StateModel::Shared, &document, ops.clone());
        assert_eq!(kept.len(), 1);
        assert_eq!(rejected.len(), 3);

        let (kept, _) = filter_to_schema(StateModel::Isolated, &document, ops);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn state_slice_includes_current_location_record() {
        let cfg = ExperienceConfig::new("shop", "Shop", StateModel::Isolated, "/tmp");
        let document = json!({
            "player": {"current_location": "counter", "inventory": []},
            "locations": {"counter": {"items": ["bottle"]}, "back_room": {}},
            "npcs": {"louisa": {"location": "counter"}, "owl": {"location": "back_room"}},
            "flags": {"night": true}
        });
        let slice = state_slice(&cfg, &document);
        assert_eq!(slice["location"]["id"], "counter");
        assert_eq!(slice["location"]["items"], json!(["bottle"]));
        assert_eq!(slice["location_ids"], json!(["back_room", "counter"]));
        assert_eq!(slice["npcs_here"][0]["id"], "louisa");
        assert_eq!(slice["flags"]["night"], true);
    }
}
