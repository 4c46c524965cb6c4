use std::sync::Arc;
use std::time::Duration;

use experience_engine::engine::EngineOptions;

mod common;
use common::{build_engine, build_engine_with, kind, strings, ScriptedInterpreter, SHOP};

const GOOD_TAKE: &str = r#"{"narrative": "You pocket the bottle.", "state_updates": [
    {"target": "world", "path": "locations.counter.items", "operation": "remove", "payload": "joyful dream bottle"},
    {"target": "player", "path": "player.inventory", "operation": "append", "payload": "joyful dream bottle"}
], "available_actions": ["look", "inventory"]}"#;

#[tokio::test]
async fn two_malformed_replies_fail_without_mutating() {
    let tmp = common::writable_fixture();
    let scripted = Arc::new(ScriptedInterpreter::new(&[
        "The bottle glows. You take it.",
        r#"{"narrative": "You take it.", "state_updates": []"#,
    ]));
    let engine = build_engine(tmp.path(), scripted.clone());
    let before = engine.ensure_player("alice", SHOP).expect("bootstrap");

    let response = engine
        .handle_message("alice", Some(SHOP), "take joyful dream bottle", false)
        .await;

    assert_eq!(kind(&response), Some("command_execution_failed"));
    assert!(response.narrative.contains("take joyful dream bottle"), "{}", response.narrative);
    assert_eq!(scripted.calls(), 2);

    let requests = scripted.requests();
    assert!(!requests[0].is_repair());
    assert!(requests[1].is_repair());
    assert!(requests[1].system_prompt.contains("previous reply could not be used"));
    assert_eq!(requests[0].user_prompt, requests[1].user_prompt);

    let after = engine.store().get_player("alice", SHOP).expect("get").expect("view");
    assert_eq!(after.revision, before.revision);
    assert_eq!(after.document, before.document);
}

#[tokio::test]
async fn repair_retry_can_succeed() {
    let tmp = common::writable_fixture();
    let scripted = Arc::new(ScriptedInterpreter::new(&["```\nnot even close\n```", GOOD_TAKE]));
    let engine = build_engine(tmp.path(), scripted.clone());

    let response = engine
        .handle_message("alice", Some(SHOP), "take joyful dream bottle", false)
        .await;

    assert!(!response.is_error(), "{:?}", response.error);
    assert_eq!(response.narrative, "You pocket the bottle.");
    assert_eq!(response.available_actions, vec!["look", "inventory"]);
    assert_eq!(scripted.calls(), 2);

    let doc = engine.player_document("alice", SHOP).expect("document");
    assert_eq!(strings(doc["player"].get("inventory")), vec!["joyful dream bottle"]);
}

#[tokio::test]
async fn reply_missing_a_field_is_malformed() {
    let tmp = common::writable_fixture();
    let scripted = Arc::new(ScriptedInterpreter::new(&[
        r#"{"narrative": "ok", "state_updates": []}"#,
        r#"{"state_updates": [], "available_actions": []}"#,
    ]));
    let engine = build_engine(tmp.path(), scripted.clone());

    let response = engine.handle_message("alice", Some(SHOP), "inventory", false).await;
    assert_eq!(kind(&response), Some("command_execution_failed"));
    assert_eq!(scripted.calls(), 2);
}

#[tokio::test]
async fn timeout_counts_as_a_failed_attempt() {
    let tmp = common::writable_fixture();
    let scripted = Arc::new(
        ScriptedInterpreter::new(&[GOOD_TAKE]).with_first_attempt_delay(Duration::from_millis(500)),
    );
    let options = EngineOptions {
        interpreter_timeout: Duration::from_millis(50),
        ..EngineOptions::default()
    };
    let engine = build_engine_with(tmp.path(), scripted.clone(), options);

    let response = engine
        .handle_message("alice", Some(SHOP), "take joyful dream bottle", false)
        .await;

    assert!(!response.is_error(), "{:?}", response.error);
    assert_eq!(scripted.calls(), 2);
    assert!(scripted.requests()[1].is_repair());
    assert!(scripted.requests()[1].system_prompt.contains("timed out"));
}

#[tokio::test]
async fn invalid_operations_in_a_valid_reply_are_dropped_individually() {
    let tmp = common::writable_fixture();
    let reply = r#"{"narrative": "Chaos.", "state_updates": [
        {"target": "player", "path": "player.inventory", "operation": "append", "payload": "spark"},
        {"target": "world", "path": "player.inventory", "operation": "append", "payload": "stolen"},
        {"target": "world", "path": "dragons.lair", "operation": "set", "payload": 1},
        {"target": "world", "path": "locations.counter.items", "operation": "remove", "payload": "unicorn"},
        {"target": "player", "path": "player.current_location", "operation": "set", "payload": "the moon"},
        {"target": "comet", "path": "x", "operation": "append", "payload": 1}
    ], "available_actions": []}"#;
    let scripted = Arc::new(ScriptedInterpreter::new(&[reply]));
    let engine = build_engine(tmp.path(), scripted.clone());

    let response = engine.handle_message("alice", Some(SHOP), "look", false).await;
    assert!(!response.is_error(), "{:?}", response.error);
    assert_eq!(scripted.calls(), 1);

    let doc = engine.player_document("alice", SHOP).expect("document");
    assert_eq!(strings(doc["player"].get("inventory")), vec!["spark"]);
    assert_eq!(doc["player"]["current_location"], "counter");
    assert!(doc.get("dragons").is_none());
    assert_eq!(
        strings(doc["locations"]["counter"].get("items")),
        vec!["joyful dream bottle", "peaceful dream bottle"]
    );
}
