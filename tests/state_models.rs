//! End-to-end play through both state models with the toy interpreter.

mod common;
use common::{kind, strings, toy_engine, SHOP, WOODS};

#[tokio::test]
async fn isolated_take_move_and_inventory() {
    let (_tmp, engine) = toy_engine();

    let taken = engine
        .handle_message("alice", Some(SHOP), "take joyful dream bottle", false)
        .await;
    assert!(!taken.is_error(), "take failed: {:?}", taken.error);
    assert_eq!(taken.narrative, "You take the joyful dream bottle.");
    assert_eq!(taken.experience_id.as_deref(), Some(SHOP));

    let moved = engine.handle_message("alice", Some(SHOP), "go to back room", false).await;
    assert!(!moved.is_error(), "go failed: {:?}", moved.error);

    let inv = engine.handle_message("alice", Some(SHOP), "inventory", false).await;
    assert_eq!(inv.narrative, "You are carrying: joyful dream bottle.");

    let doc = engine.player_document("alice", SHOP).expect("document");
    assert_eq!(doc["player"]["current_location"], "back_room");
    assert_eq!(strings(doc["player"].get("inventory")), vec!["joyful dream bottle"]);
    assert_eq!(strings(doc["player"].get("visited")), vec!["counter", "back_room"]);

    engine.handle_message("alice", Some(SHOP), "go counter", false).await;
    let look = engine.handle_message("alice", Some(SHOP), "look", false).await;
    assert_eq!(look.narrative, "You are at counter. You see: peaceful dream bottle.");

    let view = engine.store().get_player("alice", SHOP).expect("get").expect("view");
    assert_eq!(view.revision, 3);
}

#[tokio::test]
async fn isolated_players_do_not_see_each_other() {
    let (_tmp, engine) = toy_engine();

    engine
        .handle_message("alice", Some(SHOP), "take joyful dream bottle", false)
        .await;
    let bob_sees = engine.handle_message("bob", Some(SHOP), "look", false).await;
    assert!(bob_sees.narrative.contains("joyful dream bottle"), "{}", bob_sees.narrative);

    let bob = engine.player_document("bob", SHOP).expect("bob");
    assert_eq!(
        strings(bob["locations"]["counter"].get("items")),
        vec!["joyful dream bottle", "peaceful dream bottle"]
    );
    assert!(strings(bob["player"].get("inventory")).is_empty());
}

#[tokio::test]
async fn shared_world_changes_are_visible_to_everyone() {
    let (_tmp, engine) = toy_engine();
    engine.ensure_player("bob", WOODS).expect("bob joins first");

    let taken = engine
        .handle_message("alice", Some(WOODS), "pick up the silver acorn", false)
        .await;
    assert!(!taken.is_error(), "take failed: {:?}", taken.error);

    let world = engine.store().get_world(WOODS).expect("get").expect("world");
    assert_eq!(world.revision, 1);
    assert_eq!(strings(world.document["locations"]["clearing"].get("items")), vec!["glowing mushroom"]);

    let bob = engine.player_document("bob", WOODS).expect("bob");
    assert_eq!(strings(bob["locations"]["clearing"].get("items")), vec!["glowing mushroom"]);
    assert!(strings(bob["player"].get("inventory")).is_empty());

    let alice = engine.player_document("alice", WOODS).expect("alice");
    assert_eq!(strings(alice["player"].get("inventory")), vec!["silver acorn"]);

    // The item is gone for bob too, so his attempt changes nothing.
    let late = engine.handle_message("bob", Some(WOODS), "take silver acorn", false).await;
    assert_eq!(late.narrative, "There is no silver acorn here.");
    assert_eq!(engine.store().get_world(WOODS).expect("get").expect("world").revision, 1);
}

#[tokio::test]
async fn shared_movement_stays_in_the_overlay() {
    let (_tmp, engine) = toy_engine();

    let moved = engine.handle_message("alice", Some(WOODS), "walk north", false).await;
    assert!(!moved.is_error(), "go failed: {:?}", moved.error);

    let alice = engine.store().get_player("alice", WOODS).expect("get").expect("view");
    assert_eq!(alice.current_location(), Some("waypoint_28a"));
    assert!(alice.document.get("locations").is_none());

    let bob = engine.ensure_player("bob", WOODS).expect("bob");
    assert_eq!(bob.current_location(), Some("clearing"));
    assert_eq!(engine.store().get_world(WOODS).expect("get").expect("world").revision, 0);
}

#[tokio::test]
async fn aliases_produce_identical_state() {
    let (_tmp, engine) = toy_engine();
    let phrasings = [
        ("p1", "take peaceful dream bottle"),
        ("p2", "get peaceful dream bottle"),
        ("p3", "grab peaceful dream bottle"),
        ("p4", "pick up the peaceful dream bottle"),
        ("p5", "please TAKE peaceful dream bottle"),
    ];
    let mut documents = Vec::new();
    for (player, message) in phrasings {
        let response = engine.handle_message(player, Some(SHOP), message, false).await;
        assert_eq!(kind(&response), None, "{} failed", message);
        assert_eq!(response.narrative, "You take the peaceful dream bottle.");
        documents.push(engine.player_document(player, SHOP).expect("document"));
    }
    assert!(documents.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn missing_target_asks_before_calling_the_interpreter() {
    let tmp = common::writable_fixture();
    let toy = std::sync::Arc::new(common::ToyInterpreter::default());
    let engine = common::build_engine(tmp.path(), toy.clone());

    let response = engine.handle_message("alice", Some(SHOP), "take", false).await;
    assert!(!response.is_error());
    assert_eq!(response.narrative, "What do you want to take?");
    assert_eq!(toy.calls(), 0);

    let inv = engine.handle_message("alice", Some(SHOP), "i", false).await;
    assert_eq!(inv.narrative, "You are carrying nothing.");
    assert_eq!(toy.calls(), 1);
}
