//! Merge/Apply Engine: the only component that writes durable state.
//!
//! Operations are validated one at a time. A failing operation is dropped and
//! logged; its siblings still apply. Player-targeted operations run before
//! world-targeted ones. The shared world is rewritten as a whole record while
//! holding the experience's world lock, so concurrent commands serialize here
//! and each batch is applied to the freshest record.

use log::{info, warn};
use serde_json::Value;

use crate::engine::errors::EngineError;
use crate::engine::storage::StateStore;
use crate::engine::types::{
    ExperienceConfig, MutationKind, MutationTarget, PlayerView, StateModel, StateMutation, WorldState,
    LOCATIONS_SECTION, PLAYER_SECTION,
};
use crate::logutil::{escape_log, summarize_mutations};
use crate::metrics;
use crate::validation::validate_state_path;

/// An operation that failed validation, with the reason it was dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedMutation {
    pub mutation: StateMutation,
    pub reason: String,
}

/// Summary of one apply batch. Logged for operators; never shown to players.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub applied: Vec<StateMutation>,
    pub dropped: Vec<DroppedMutation>,
    /// Revision of the shared world after the batch, when it was written.
    pub world_revision: Option<u64>,
}

impl ApplyReport {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn dropped_count(&self) -> usize {
        self.dropped.len()
    }

    pub fn is_clean(&self) -> bool {
        self.dropped.is_empty()
    }

    pub fn record_drop(&mut self, mutation: StateMutation, reason: impl Into<String>) {
        self.dropped.push(DroppedMutation {
            mutation,
            reason: reason.into(),
        });
    }

    pub fn merge(&mut self, other: ApplyReport) {
        self.applied.extend(other.applied);
        self.dropped.extend(other.dropped);
        if other.world_revision.is_some() {
            self.world_revision = other.world_revision;
        }
    }
}

pub struct MergeEngine {
    store: StateStore,
}

impl MergeEngine {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Validate and commit a batch of operations for one player.
    pub async fn apply(
        &self,
        player_id: &str,
        cfg: &ExperienceConfig,
        operations: Vec<StateMutation>,
    ) -> Result<ApplyReport, EngineError> {
        let mut report = ApplyReport::default();
        if operations.is_empty() {
            return Ok(report);
        }

        let shared = cfg.state_model == StateModel::Shared;
        let touches_world = shared && operations.iter().any(|op| op.target == MutationTarget::World);
        let needs_world = shared;

        // Lock order is always world, then player.
        let _world_guard = if touches_world {
            Some(self.store.lock_world(&cfg.id).await?)
        } else {
            None
        };
        let _player_guard = self.store.lock_player(player_id, &cfg.id).await?;

        let mut view = self
            .store
            .get_player(player_id, &cfg.id)?
            .ok_or_else(|| EngineError::NotFound(format!("player view: {}/{}", cfg.id, player_id)))?;
        let mut world = if needs_world {
            Some(
                self.store
                    .get_world(&cfg.id)?
                    .ok_or_else(|| EngineError::NotFound(format!("world: {}", cfg.id)))?,
            )
        } else {
            None
        };

        let mut ordered = operations;
        // Stable: relative order inside each target is preserved.
        ordered.sort_by_key(|op| match op.target {
            MutationTarget::Player => 0,
            MutationTarget::World => 1,
        });

        let mut player_dirty = false;
        let mut world_dirty = false;
        for op in ordered {
            let outcome = apply_to_records(&mut view, world.as_mut(), &op);
            match outcome {
                Ok(wrote_world) => {
                    if wrote_world {
                        world_dirty = true;
                    } else {
                        player_dirty = true;
                    }
                    report.applied.push(op);
                }
                Err(e) => {
                    warn!(
                        "Dropped mutation for {}/{}: {} ({})",
                        cfg.id,
                        escape_log(player_id),
                        escape_log(&op.to_string()),
                        e
                    );
                    report.record_drop(op, e.to_string());
                }
            }
        }

        let player_write = if player_dirty {
            view.revision += 1;
            view.touch();
            Some(&view)
        } else {
            None
        };
        let world_write = match world.as_mut() {
            Some(w) if world_dirty => {
                w.revision += 1;
                w.touch();
                report.world_revision = Some(w.revision);
                Some(&*w)
            }
            _ => None,
        };
        self.store.commit(player_write, world_write)?;

        metrics::record_apply(report.applied_count(), report.dropped_count());
        info!(
            "Applied {} / dropped {} mutation(s) for {}/{}: {}",
            report.applied_count(),
            report.dropped_count(),
            cfg.id,
            escape_log(player_id),
            summarize_mutations(&report.applied)
        );
        Ok(report)
    }
}

/// Apply one operation to the right document. Returns `true` when the shared world
/// record was written, `false` when the player's view was.
fn apply_to_records(
    view: &mut PlayerView,
    world: Option<&mut WorldState>,
    op: &StateMutation,
) -> Result<bool, EngineError> {
    validate_state_path(&op.path).map_err(|e| EngineError::InvariantViolation(format!("{}: {}", op.path, e)))?;
    let segments = op.segments();
    let under_player = segments.first() == Some(&PLAYER_SECTION);

    match (op.target, world) {
        (MutationTarget::World, _) if under_player => Err(EngineError::InvariantViolation(format!(
            "world mutation may not address the player section ({})",
            op.path
        ))),
        (MutationTarget::World, Some(world)) => {
            let locations = location_ids(&world.document);
            apply_mutation(&mut world.document, op, &locations)?;
            Ok(true)
        }
        // Isolated: the player's view is their whole world.
        (MutationTarget::World, None) | (MutationTarget::Player, None) => {
            let locations = location_ids(&view.document);
            apply_mutation(&mut view.document, op, &locations)?;
            track_visit(&mut view.document, op);
            Ok(false)
        }
        (MutationTarget::Player, Some(world)) => {
            if !under_player {
                return Err(EngineError::InvariantViolation(format!(
                    "player overlay only holds the player section ({})",
                    op.path
                )));
            }
            let locations = location_ids(&world.document);
            apply_mutation(&mut view.document, op, &locations)?;
            track_visit(&mut view.document, op);
            Ok(false)
        }
    }
}

fn location_ids(document: &Value) -> Vec<String> {
    document
        .get(LOCATIONS_SECTION)
        .and_then(Value::as_object)
        .map(|locs| locs.keys().cloned().collect())
        .unwrap_or_default()
}

fn resolve_mut<'a>(mut node: &'a mut Value, segments: &[&str]) -> Option<&'a mut Value> {
    for segment in segments {
        node = match node {
            Value::Object(map) => map.get_mut(*segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(node)
}

/// Loose element match used by `remove`: exact JSON equality, case-insensitive
/// string equality, or an object whose `id`/`name` equals the payload string.
fn element_matches(element: &Value, payload: &Value) -> bool {
    if element == payload {
        return true;
    }
    let Some(wanted) = payload.as_str() else {
        return false;
    };
    match element {
        Value::String(s) => s.eq_ignore_ascii_case(wanted),
        Value::Object(map) => ["id", "name"].iter().any(|key| {
            map.get(*key)
                .and_then(Value::as_str)
                .is_some_and(|v| v.eq_ignore_ascii_case(wanted))
        }),
        _ => false,
    }
}

fn same_shape(existing: &Value, replacement: &Value) -> bool {
    match existing {
        Value::Object(_) => replacement.is_object(),
        Value::Array(_) => replacement.is_array(),
        _ => true,
    }
}

/// Apply a single operation to a document. Either the whole operation applies or
/// the document is left untouched.
pub fn apply_mutation(document: &mut Value, op: &StateMutation, location_ids: &[String]) -> Result<(), EngineError> {
    let violation = |why: &str| EngineError::InvariantViolation(format!("{} {:?}: {}", op.path, op.operation, why));
    let segments = op.segments();

    match op.operation {
        MutationKind::Append => {
            if op.payload.is_null() {
                return Err(violation("append requires a payload"));
            }
            let node = resolve_mut(document, &segments).ok_or_else(|| violation("path does not resolve"))?;
            let items = node.as_array_mut().ok_or_else(|| violation("target is not a list"))?;
            items.push(op.payload.clone());
            Ok(())
        }
        MutationKind::Remove => {
            let node = resolve_mut(document, &segments).ok_or_else(|| violation("path does not resolve"))?;
            match node {
                Value::Array(items) => {
                    let pos = items
                        .iter()
                        .position(|e| element_matches(e, &op.payload))
                        .ok_or_else(|| violation(&format!("{} is not present", op.payload)))?;
                    items.remove(pos);
                    Ok(())
                }
                Value::Object(map) => {
                    let key = op.payload.as_str().ok_or_else(|| violation("object removal needs a key"))?;
                    map.remove(key)
                        .map(|_| ())
                        .ok_or_else(|| violation(&format!("key {} is not present", key)))
                }
                _ => Err(violation("target is not a list or map")),
            }
        }
        MutationKind::Set => {
            let (last, parent_path) = segments.split_last().ok_or_else(|| violation("empty path"))?;
            if segments.as_slice() == [PLAYER_SECTION, "current_location"] {
                let destination = op
                    .payload
                    .as_str()
                    .ok_or_else(|| violation("location must be a string id"))?;
                if !location_ids.iter().any(|id| id == destination) {
                    return Err(violation(&format!("unknown location {}", destination)));
                }
            }
            let parent = resolve_mut(document, parent_path).ok_or_else(|| violation("parent path does not resolve"))?;
            match parent {
                Value::Object(map) => {
                    if let Some(existing) = map.get(*last) {
                        if !same_shape(existing, &op.payload) {
                            return Err(violation("set would change a container's type"));
                        }
                    }
                    map.insert((*last).to_string(), op.payload.clone());
                    Ok(())
                }
                Value::Array(items) => {
                    let idx = last
                        .parse::<usize>()
                        .map_err(|_| violation("list index must be numeric"))?;
                    let slot = items.get_mut(idx).ok_or_else(|| violation("list index out of range"))?;
                    if !same_shape(slot, &op.payload) {
                        return Err(violation("set would change a container's type"));
                    }
                    *slot = op.payload.clone();
                    Ok(())
                }
                _ => Err(violation("parent is not a map or list")),
            }
        }
    }
}

/// Keep `player.visited` in step with successful moves.
fn track_visit(document: &mut Value, op: &StateMutation) {
    if op.operation != MutationKind::Set || op.path != "player.current_location" {
        return;
    }
    let Some(location) = op.payload.as_str() else {
        return;
    };
    if let Some(visited) = document
        .get_mut(PLAYER_SECTION)
        .and_then(|p| p.get_mut("visited"))
        .and_then(Value::as_array_mut)
    {
        if !visited.iter().any(|v| v.as_str() == Some(location)) {
            visited.push(Value::String(location.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "player": {"current_location": "counter", "inventory": ["coin"], "visited": ["counter"]},
            "locations": {
                "counter": {"items": ["joyful dream bottle", {"id": "lamp", "name": "Brass Lamp"}]},
                "back_room": {"items": []}
            }
        })
    }

    fn ids(document: &Value) -> Vec<String> {
        location_ids(document)
    }

    #[test]
    fn append_and_remove_lists() {
        let mut d = doc();
        let locs = ids(&d);
        apply_mutation(
            &mut d,
            &StateMutation::remove(MutationTarget::World, "locations.counter.items", json!("Joyful Dream Bottle")),
            &locs,
        )
        .expect("remove");
        apply_mutation(
            &mut d,
            &StateMutation::append(MutationTarget::Player, "player.inventory", json!("joyful dream bottle")),
            &locs,
        )
        .expect("append");
        assert_eq!(d["player"]["inventory"], json!(["coin", "joyful dream bottle"]));
        assert_eq!(d["locations"]["counter"]["items"].as_array().unwrap().len(), 1);

        apply_mutation(
            &mut d,
            &StateMutation::remove(MutationTarget::World, "locations.counter.items", json!("lamp")),
            &locs,
        )
        .expect("remove by id");
        assert_eq!(d["locations"]["counter"]["items"], json!([]));
    }

    #[test]
    fn removing_missing_item_is_a_violation_and_leaves_doc_untouched() {
        let mut d = doc();
        let before = d.clone();
        let err = apply_mutation(
            &mut d,
            &StateMutation::remove(MutationTarget::Player, "player.inventory", json!("sword")),
            &ids(&before),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "invariant_violation");
        assert_eq!(d, before);
    }

    #[test]
    fn append_does_not_deduplicate() {
        let mut d = doc();
        let locs = ids(&d);
        for _ in 0..2 {
            apply_mutation(
                &mut d,
                &StateMutation::append(MutationTarget::Player, "player.inventory", json!("coin")),
                &locs,
            )
            .expect("append");
        }
        assert_eq!(d["player"]["inventory"], json!(["coin", "coin", "coin"]));
    }

    #[test]
    fn set_guards_paths_types_and_locations() {
        let mut d = doc();
        let locs = ids(&d);
        apply_mutation(
            &mut d,
            &StateMutation::set(MutationTarget::Player, "player.current_location", json!("back_room")),
            &locs,
        )
        .expect("move");
        assert_eq!(d["player"]["current_location"], "back_room");

        let orphan = StateMutation::set(MutationTarget::Player, "player.current_location", json!("moon"));
        assert!(apply_mutation(&mut d, &orphan, &locs).is_err());

        let retype = StateMutation::set(MutationTarget::Player, "player.inventory", json!("nothing"));
        assert!(apply_mutation(&mut d, &retype, &locs).is_err());

        let dangling = StateMutation::set(MutationTarget::World, "locations.attic.items", json!([]));
        assert!(apply_mutation(&mut d, &dangling, &locs).is_err());

        let flag = StateMutation::set(MutationTarget::World, "locations.counter.lit", json!(true));
        apply_mutation(&mut d, &flag, &locs).expect("new key under existing map");
        assert_eq!(d["locations"]["counter"]["lit"], true);

        let indexed = StateMutation::set(MutationTarget::Player, "player.inventory.0", json!("gold coin"));
        apply_mutation(&mut d, &indexed, &locs).expect("index set");
        assert_eq!(d["player"]["inventory"][0], "gold coin");
    }

    #[test]
    fn overlay_rejects_world_paths_for_player_target() {
        let mut view = PlayerView::new(
            "alice",
            "demo",
            StateModel::Shared,
            json!({"player": {"current_location": "counter", "inventory": [], "visited": []}}),
        );
        let mut world = WorldState::from_template("demo", &doc());
        let op = StateMutation::remove(MutationTarget::Player, "locations.counter.items", json!("lamp"));
        assert!(apply_to_records(&mut view, Some(&mut world), &op).is_err());

        let op = StateMutation::append(MutationTarget::World, "player.inventory", json!("lamp"));
        assert!(apply_to_records(&mut view, Some(&mut world), &op).is_err());

        let op = StateMutation::set(MutationTarget::Player, "player.current_location", json!("back_room"));
        assert!(!apply_to_records(&mut view, Some(&mut world), &op).expect("move"));
        assert_eq!(view.document["player"]["visited"], json!(["back_room"]));
    }

    #[test]
    fn report_merging() {
        let mut a = ApplyReport::default();
        a.record_drop(
            StateMutation::set(MutationTarget::World, "x", json!(1)),
            "outside schema",
        );
        let mut b = ApplyReport::default();
        b.applied.push(StateMutation::set(MutationTarget::World, "y", json!(2)));
        b.world_revision = Some(4);
        a.merge(b);
        assert_eq!(a.applied_count(), 1);
        assert_eq!(a.dropped_count(), 1);
        assert_eq!(a.world_revision, Some(4));
        assert!(!a.is_clean());
    }
}
