//! Test utilities & fixtures.
//! Provides access to the integration experiences under `tests/test-data-int`
//! plus scripted interpreters that stand in for the LLM.
#![allow(dead_code)] // each test binary uses a different subset

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use experience_engine::engine::template::ExperienceCatalog;
use experience_engine::engine::{
    EngineOptions, ExperienceEngine, Interpreter, InterpreterError, InterpreterRequest, StateStoreBuilder,
};

pub const SHOP: &str = "dream-shop";
pub const WOODS: &str = "wylding-woods";

/// Return the path to the static integration test fixture directory.
pub fn fixture_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("test-data-int")
}

fn copy_tree(src: &Path, dst: &Path) {
    std::fs::create_dir_all(dst).unwrap();
    for entry in std::fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let target = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), &target).unwrap();
        }
    }
}

/// Writable copy of the fixture experiences plus an empty state directory.
/// Layout: `<tmp>/experiences/...` and `<tmp>/state`.
pub fn writable_fixture() -> tempfile::TempDir {
    let tmp = tempfile::tempdir().expect("tempdir");
    copy_tree(
        &fixture_root().join("experiences"),
        &tmp.path().join("experiences"),
    );
    tmp
}

pub fn build_engine(root: &Path, interpreter: Arc<dyn Interpreter>) -> ExperienceEngine {
    build_engine_with(root, interpreter, EngineOptions::default())
}

pub fn build_engine_with(root: &Path, interpreter: Arc<dyn Interpreter>, options: EngineOptions) -> ExperienceEngine {
    let catalog = ExperienceCatalog::load(root.join("experiences")).expect("catalog");
    let store = StateStoreBuilder::new(root.join("state"))
        .without_flush()
        .open()
        .expect("store");
    ExperienceEngine::new(catalog, store, interpreter, options)
}

/// Fixture copy plus an engine driven by [`ToyInterpreter`].
pub fn toy_engine() -> (tempfile::TempDir, ExperienceEngine) {
    let tmp = writable_fixture();
    let engine = build_engine(tmp.path(), Arc::new(ToyInterpreter::default()));
    (tmp, engine)
}

pub fn kind(response: &experience_engine::engine::MessageResponse) -> Option<&str> {
    response.error.as_ref().map(|e| e.kind.as_str())
}

pub fn strings(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Deterministic interpreter that understands the fixture verbs by reading the
/// structured state slice it is handed.
#[derive(Default)]
pub struct ToyInterpreter {
    calls: AtomicUsize,
}

impl ToyInterpreter {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn respond(request: &InterpreterRequest) -> Value {
        let state = &request.state;
        let here = state["location"]["id"].as_str().unwrap_or_default().to_string();
        let target = request
            .arguments
            .trim()
            .trim_start_matches("the ")
            .to_string();
        let reply = |narrative: String, updates: Vec<Value>| {
            json!({"narrative": narrative, "state_updates": updates, "available_actions": []})
        };
        match request.command.as_str() {
            "take" => {
                let items = strings(state["location"].get("items"));
                match items.iter().find(|i| i.eq_ignore_ascii_case(&target)) {
                    Some(item) => reply(
                        format!("You take the {}.", item),
                        vec![
                            json!({"target": "world", "path": format!("locations.{}.items", here), "operation": "remove", "payload": item}),
                            json!({"target": "player", "path": "player.inventory", "operation": "append", "payload": item}),
                        ],
                    ),
                    None => reply(format!("There is no {} here.", target), vec![]),
                }
            }
            "go" => {
                let destination = state["location"]["exits"]
                    .get(target.as_str())
                    .and_then(Value::as_str)
                    .map(str::to_string);
                match destination {
                    Some(to) => reply(
                        format!("You go {}.", target),
                        vec![json!({"target": "player", "path": "player.current_location", "operation": "set", "payload": to})],
                    ),
                    None => reply(format!("You can't go {} from here.", target), vec![]),
                }
            }
            "inventory" => {
                let items = strings(state["player"].get("inventory"));
                if items.is_empty() {
                    reply("You are carrying nothing.".into(), vec![])
                } else {
                    reply(format!("You are carrying: {}.", items.join(", ")), vec![])
                }
            }
            "look" => {
                let items = strings(state["location"].get("items"));
                reply(format!("You are at {}. You see: {}.", here, items.join(", ")), vec![])
            }
            other => reply(format!("Nothing happens when you {}.", other), vec![]),
        }
    }
}

#[async_trait]
impl Interpreter for ToyInterpreter {
    async fn interpret(&self, request: &InterpreterRequest) -> Result<String, InterpreterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::respond(request).to_string())
    }
}

/// Replays queued raw responses and records every request it sees.
/// Once the queue is empty it keeps returning `fallback`.
pub struct ScriptedInterpreter {
    responses: Mutex<VecDeque<String>>,
    fallback: String,
    requests: Mutex<Vec<InterpreterRequest>>,
    delay: Option<Duration>,
}

impl ScriptedInterpreter {
    pub fn new(responses: &[&str]) -> Self {
        Self {
            responses: Mutex::new(responses.iter().map(|r| r.to_string()).collect()),
            fallback: "not json at all".into(),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Sleep this long before answering the first attempt of each command.
    pub fn with_first_attempt_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<InterpreterRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Interpreter for ScriptedInterpreter {
    async fn interpret(&self, request: &InterpreterRequest) -> Result<String, InterpreterError> {
        self.requests.lock().unwrap().push(request.clone());
        if let (Some(delay), false) = (self.delay, request.is_repair()) {
            tokio::time::sleep(delay).await;
        }
        let next = self.responses.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}
