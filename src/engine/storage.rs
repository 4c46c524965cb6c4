use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use sled::transaction::{TransactionError, Transactional};
use sled::IVec;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::engine::errors::EngineError;
use crate::engine::types::{
    PlayerView, StateModel, WorldState, PLAYER_VIEW_SCHEMA_VERSION, WORLD_SCHEMA_VERSION,
};
use crate::validation::storage_key_segment;

const TREE_WORLDS: &str = "worlds";
const TREE_PLAYERS: &str = "player_views";
const TREE_AUDIT: &str = "audit";

fn next_timestamp_nanos() -> i64 {
    let now = Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros() * 1000)
}

/// On-disk envelope for a world record. The document is kept as JSON text so the
/// envelope stays bincode-friendly.
#[derive(Serialize, Deserialize)]
struct StoredWorld {
    experience_id: String,
    document_json: String,
    revision: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    schema_version: u8,
}

#[derive(Serialize, Deserialize)]
struct StoredPlayerView {
    player_id: String,
    experience_id: String,
    state_model: StateModel,
    document_json: String,
    revision: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    schema_version: u8,
}

/// One admin command execution, kept for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub experience_id: String,
    pub player_id: String,
    pub command: String,
    pub arguments: String,
    pub applied: usize,
    pub dropped: usize,
    pub succeeded: bool,
}

impl AuditEntry {
    pub fn new(experience_id: &str, player_id: &str, command: &str, arguments: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            experience_id: experience_id.to_string(),
            player_id: player_id.to_string(),
            command: command.to_string(),
            arguments: arguments.to_string(),
            applied: 0,
            dropped: 0,
            succeeded: false,
        }
    }
}

/// Helper builder so tests can easily create throwaway stores with custom paths.
pub struct StateStoreBuilder {
    path: PathBuf,
    flush_every_write: bool,
}

impl StateStoreBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            flush_every_write: true,
        }
    }

    /// Skip the explicit flush after each write (sled still flushes in the background).
    pub fn without_flush(mut self) -> Self {
        self.flush_every_write = false;
        self
    }

    pub fn open(self) -> Result<StateStore, EngineError> {
        StateStore::open_with_options(self.path, self.flush_every_write)
    }
}

type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Held while a record is being rewritten. Dropping the last guard for a key
/// removes its entry from the lock table.
pub struct RecordLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    locks: LockMap,
}

impl Drop for RecordLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        if let Ok(mut table) = self.locks.lock() {
            // Waiters clone the Arc under this mutex, so a count of one means nobody else wants it.
            if table.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                table.remove(&self.key);
            }
        }
    }
}

/// Sled-backed persistence for world records, player views and the admin audit trail.
#[derive(Clone)]
pub struct StateStore {
    _db: sled::Db,
    worlds: sled::Tree,
    players: sled::Tree,
    audit: sled::Tree,
    flush_every_write: bool,
    locks: LockMap,
}

impl StateStore {
    /// Open (or create) the state store rooted at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        Self::open_with_options(path, true)
    }

    fn open_with_options<P: AsRef<Path>>(path: P, flush_every_write: bool) -> Result<Self, EngineError> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref)?;
        let db = sled::open(path_ref)?;
        let worlds = db.open_tree(TREE_WORLDS)?;
        let players = db.open_tree(TREE_PLAYERS)?;
        let audit = db.open_tree(TREE_AUDIT)?;
        debug!("Opened state store at {}", path_ref.display());
        Ok(Self {
            _db: db,
            worlds,
            players,
            audit,
            flush_every_write,
            locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn world_key(experience_id: &str) -> Vec<u8> {
        format!("world:{}", storage_key_segment(experience_id)).into_bytes()
    }

    fn player_prefix(experience_id: &str) -> String {
        format!("view:{}:", storage_key_segment(experience_id))
    }

    fn player_key(player_id: &str, experience_id: &str) -> Vec<u8> {
        format!(
            "{}{}",
            Self::player_prefix(experience_id),
            storage_key_segment(player_id)
        )
        .into_bytes()
    }

    fn audit_key(entry: &AuditEntry, nanos: i64) -> Vec<u8> {
        format!(
            "audit:{}:{:020}:{}",
            storage_key_segment(&entry.experience_id),
            nanos,
            entry.id.simple()
        )
        .into_bytes()
    }

    fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, EngineError> {
        Ok(bincode::serialize(value)?)
    }

    fn deserialize<T: serde::de::DeserializeOwned>(bytes: IVec) -> Result<T, EngineError> {
        Ok(bincode::deserialize::<T>(&bytes)?)
    }

    fn encode_world(world: &WorldState) -> Result<Vec<u8>, EngineError> {
        Self::serialize(&StoredWorld {
            experience_id: world.experience_id.clone(),
            document_json: serde_json::to_string(&world.document)?,
            revision: world.revision,
            created_at: world.created_at,
            updated_at: world.updated_at,
            schema_version: WORLD_SCHEMA_VERSION,
        })
    }

    fn decode_world(bytes: IVec) -> Result<WorldState, EngineError> {
        let stored: StoredWorld = Self::deserialize(bytes)?;
        if stored.schema_version != WORLD_SCHEMA_VERSION {
            return Err(EngineError::SchemaMismatch {
                entity: "world",
                expected: WORLD_SCHEMA_VERSION,
                found: stored.schema_version,
            });
        }
        Ok(WorldState {
            experience_id: stored.experience_id,
            document: serde_json::from_str(&stored.document_json)?,
            revision: stored.revision,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
            schema_version: stored.schema_version,
        })
    }

    fn encode_player(view: &PlayerView) -> Result<Vec<u8>, EngineError> {
        Self::serialize(&StoredPlayerView {
            player_id: view.player_id.clone(),
            experience_id: view.experience_id.clone(),
            state_model: view.state_model,
            document_json: serde_json::to_string(&view.document)?,
            revision: view.revision,
            created_at: view.created_at,
            updated_at: view.updated_at,
            schema_version: PLAYER_VIEW_SCHEMA_VERSION,
        })
    }

    fn decode_player(bytes: IVec) -> Result<PlayerView, EngineError> {
        let stored: StoredPlayerView = Self::deserialize(bytes)?;
        if stored.schema_version != PLAYER_VIEW_SCHEMA_VERSION {
            return Err(EngineError::SchemaMismatch {
                entity: "player_view",
                expected: PLAYER_VIEW_SCHEMA_VERSION,
                found: stored.schema_version,
            });
        }
        Ok(PlayerView {
            player_id: stored.player_id,
            experience_id: stored.experience_id,
            state_model: stored.state_model,
            document: serde_json::from_str(&stored.document_json)?,
            revision: stored.revision,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
            schema_version: stored.schema_version,
        })
    }

    fn flush(&self, tree: &sled::Tree) -> Result<(), EngineError> {
        if self.flush_every_write {
            tree.flush()?;
        }
        Ok(())
    }

    /// Fetch the shared world record for an experience, if one exists.
    pub fn get_world(&self, experience_id: &str) -> Result<Option<WorldState>, EngineError> {
        match self.worlds.get(Self::world_key(experience_id))? {
            Some(bytes) => Ok(Some(Self::decode_world(bytes)?)),
            None => Ok(None),
        }
    }

    /// Conditionally create the world record. Returns `true` if this call created it,
    /// `false` if a record already existed (the existing record is left untouched).
    pub fn create_world_if_absent(&self, world: &WorldState) -> Result<bool, EngineError> {
        let key = Self::world_key(&world.experience_id);
        let bytes = Self::encode_world(world)?;
        let outcome = self
            .worlds
            .compare_and_swap(key, None as Option<&[u8]>, Some(bytes))?;
        self.flush(&self.worlds)?;
        Ok(outcome.is_ok())
    }

    /// Fetch a player's view record for an experience.
    pub fn get_player(&self, player_id: &str, experience_id: &str) -> Result<Option<PlayerView>, EngineError> {
        match self.players.get(Self::player_key(player_id, experience_id))? {
            Some(bytes) => Ok(Some(Self::decode_player(bytes)?)),
            None => Ok(None),
        }
    }

    /// Conditionally create a player view. When another caller created it first the
    /// existing record is returned instead.
    pub fn create_player_if_absent(&self, view: &PlayerView) -> Result<(PlayerView, bool), EngineError> {
        let key = Self::player_key(&view.player_id, &view.experience_id);
        let bytes = Self::encode_player(view)?;
        let outcome = self
            .players
            .compare_and_swap(key.clone(), None as Option<&[u8]>, Some(bytes))?;
        self.flush(&self.players)?;
        match outcome {
            Ok(()) => Ok((view.clone(), true)),
            Err(_) => {
                let existing = self.get_player(&view.player_id, &view.experience_id)?;
                existing
                    .map(|v| (v, false))
                    .ok_or_else(|| EngineError::Internal("player view vanished during create".into()))
            }
        }
    }

    /// Insert or replace a player view.
    pub fn put_player(&self, view: &PlayerView) -> Result<(), EngineError> {
        let bytes = Self::encode_player(view)?;
        self.players
            .insert(Self::player_key(&view.player_id, &view.experience_id), bytes)?;
        self.flush(&self.players)?;
        Ok(())
    }

    /// List every player that has bootstrapped into an experience.
    pub fn list_player_ids(&self, experience_id: &str) -> Result<Vec<String>, EngineError> {
        let mut ids = Vec::new();
        for entry in self.players.scan_prefix(Self::player_prefix(experience_id).as_bytes()) {
            let (_, bytes) = entry?;
            ids.push(Self::decode_player(bytes)?.player_id);
        }
        Ok(ids)
    }

    /// Write a player view and (optionally) the world record in one sled transaction.
    pub fn commit(&self, player: Option<&PlayerView>, world: Option<&WorldState>) -> Result<(), EngineError> {
        let player_entry = match player {
            Some(view) => Some((
                Self::player_key(&view.player_id, &view.experience_id),
                Self::encode_player(view)?,
            )),
            None => None,
        };
        let world_entry = match world {
            Some(world) => Some((Self::world_key(&world.experience_id), Self::encode_world(world)?)),
            None => None,
        };
        if player_entry.is_none() && world_entry.is_none() {
            return Ok(());
        }

        let result: sled::transaction::TransactionResult<()> =
            (&self.players, &self.worlds).transaction(|(players, worlds)| {
                if let Some((key, bytes)) = &player_entry {
                    players.insert(key.as_slice(), bytes.as_slice())?;
                }
                if let Some((key, bytes)) = &world_entry {
                    worlds.insert(key.as_slice(), bytes.as_slice())?;
                }
                Ok(())
            });
        result.map_err(|e| match e {
            TransactionError::Storage(err) => EngineError::Sled(err),
            TransactionError::Abort(()) => EngineError::Internal("state commit aborted".into()),
        })?;

        self.flush(&self.players)?;
        self.flush(&self.worlds)?;
        Ok(())
    }

    /// Append an admin audit entry.
    pub fn append_audit(&self, entry: &AuditEntry) -> Result<(), EngineError> {
        let key = Self::audit_key(entry, next_timestamp_nanos());
        self.audit.insert(key, Self::serialize(entry)?)?;
        self.flush(&self.audit)?;
        Ok(())
    }

    /// Most recent audit entries for an experience, newest first.
    pub fn list_audit(&self, experience_id: &str, limit: usize) -> Result<Vec<AuditEntry>, EngineError> {
        let prefix = format!("audit:{}:", storage_key_segment(experience_id));
        self.audit
            .scan_prefix(prefix.as_bytes())
            .rev()
            .take(limit)
            .map(|result| {
                result
                    .map_err(EngineError::from)
                    .and_then(|(_key, value)| Self::deserialize(value))
            })
            .collect()
    }

    async fn lock_record(&self, key: String) -> Result<RecordLockGuard, EngineError> {
        let lock = {
            let mut table = self
                .locks
                .lock()
                .map_err(|_| EngineError::Internal("state lock table poisoned".into()))?;
            table
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        Ok(RecordLockGuard {
            guard: Some(lock.lock_owned().await),
            key,
            locks: self.locks.clone(),
        })
    }

    /// Serialize read-modify-write cycles on one experience's shared world.
    pub async fn lock_world(&self, experience_id: &str) -> Result<RecordLockGuard, EngineError> {
        self.lock_record(format!("world:{}", experience_id)).await
    }

    /// Serialize writes to a single player's view.
    pub async fn lock_player(&self, player_id: &str, experience_id: &str) -> Result<RecordLockGuard, EngineError> {
        self.lock_record(format!("view:{}:{}", experience_id, player_id)).await
    }

    /// Number of records with a live lock entry.
    pub fn held_lock_count(&self) -> usize {
        self.locks.lock().map(|table| table.len()).unwrap_or(0)
    }
}
