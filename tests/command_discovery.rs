use std::sync::Arc;

use experience_engine::engine::registry::fingerprint_sources;

mod common;
use common::{build_engine, ToyInterpreter, SHOP, WOODS};

#[test]
fn fixture_experiences_discover_cleanly_except_known_bad_files() {
    let tmp = common::writable_fixture();
    let engine = build_engine(tmp.path(), Arc::new(ToyInterpreter::default()));

    let shop = engine.discover(SHOP).expect("shop");
    let player: Vec<&str> = shop.player_commands().map(|c| c.name.as_str()).collect();
    assert_eq!(player.len(), 4);
    for verb in ["take", "go", "inventory", "look"] {
        assert!(player.contains(&verb), "missing {}", verb);
    }
    assert_eq!(shop.admin_commands().count(), 9);
    assert_eq!(shop.skipped().len(), 1);
    assert!(shop.skipped()[0].file.ends_with("haggle.md"));
    assert!(shop.skipped()[0].reason.contains("description"));

    let woods = engine.discover(WOODS).expect("woods");
    assert!(woods.skipped().is_empty());
    assert!(woods.resolve("play", false).is_some());
    assert!(woods.resolve("tp", false).is_none());
    assert_eq!(woods.resolve("TP", true).map(|c| c.name.clone()).as_deref(), Some("teleport"));
    assert_eq!(woods.resolve("go to", false).map(|c| c.name.clone()).as_deref(), Some("go"));
}

#[test]
fn discover_all_reports_every_experience() {
    let tmp = common::writable_fixture();
    let engine = build_engine(tmp.path(), Arc::new(ToyInterpreter::default()));

    let ids: Vec<String> = engine
        .discover_all()
        .into_iter()
        .map(|(id, result)| {
            assert!(result.is_ok(), "{} failed discovery", id);
            id
        })
        .collect();
    assert_eq!(ids, vec![SHOP.to_string(), WOODS.to_string()]);
}

#[tokio::test]
async fn reload_picks_up_new_command_files() {
    let tmp = common::writable_fixture();
    let engine = build_engine(tmp.path(), Arc::new(ToyInterpreter::default()));
    let cfg = engine.catalog().get(SHOP).expect("experience");
    let before = fingerprint_sources(&cfg).expect("fingerprint");

    let first = engine.handle_message("alice", Some(SHOP), "dance", false).await;
    assert!(first.narrative.starts_with("I didn't understand"));

    std::fs::write(
        tmp.path().join("experiences/dream-shop/game-logic/dance.md"),
        "---\ncommand: dance\naliases: [jig]\ndescription: Dance in place\n---\nDescribe a short dance.\n",
    )
    .expect("write command");
    assert_ne!(fingerprint_sources(&cfg).expect("fingerprint"), before);

    let set = engine.reload_experience(SHOP).expect("reload");
    assert!(set.resolve("jig", false).is_some());

    let second = engine.handle_message("alice", Some(SHOP), "jig", false).await;
    assert!(!second.is_error(), "{:?}", second.error);
    assert_eq!(second.narrative, "Nothing happens when you dance.");
}

#[test]
fn experiences_with_bad_config_are_skipped() {
    let tmp = common::writable_fixture();
    let broken = tmp.path().join("experiences/broken");
    std::fs::create_dir_all(&broken).expect("mkdir");
    std::fs::write(broken.join("experience.toml"), "id = \"../escape\"\nname = \"x\"\n").expect("write");
    std::fs::create_dir_all(tmp.path().join("experiences/not-an-experience")).expect("mkdir");

    let engine = build_engine(tmp.path(), Arc::new(ToyInterpreter::default()));
    let ids: Vec<String> = engine.catalog().list().iter().map(|cfg| cfg.id.clone()).collect();
    assert_eq!(ids, vec![SHOP.to_string(), WOODS.to_string()]);
}
