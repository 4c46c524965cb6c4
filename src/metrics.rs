//! Process-wide counters for dispatch outcomes.
//! Read with [`snapshot`]; there is no exposition endpoint.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

static LLM_RETRIES: AtomicU64 = AtomicU64::new(0);
static LLM_FAILURES: AtomicU64 = AtomicU64::new(0);
static OPS_APPLIED: AtomicU64 = AtomicU64::new(0);
static OPS_DROPPED: AtomicU64 = AtomicU64::new(0);
static FORBIDDEN_ATTEMPTS: AtomicU64 = AtomicU64::new(0);

static INTENT_COUNTERS: OnceLock<Mutex<HashMap<String, u64>>> = OnceLock::new();

fn intent_lock() -> MutexGuard<'static, HashMap<String, u64>> {
    INTENT_COUNTERS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Count one classified message by intent label.
pub fn record_intent(label: &str) -> u64 {
    let mut guard = intent_lock();
    let counter = guard.entry(label.to_string()).or_default();
    *counter = counter.saturating_add(1);
    *counter
}

pub fn record_llm_retry() {
    LLM_RETRIES.fetch_add(1, Ordering::Relaxed);
}

pub fn record_llm_failure() {
    LLM_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub fn record_forbidden() {
    FORBIDDEN_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_apply(applied: usize, dropped: usize) {
    OPS_APPLIED.fetch_add(applied as u64, Ordering::Relaxed);
    OPS_DROPPED.fetch_add(dropped as u64, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub intents: HashMap<String, u64>,
    pub llm_retries: u64,
    pub llm_failures: u64,
    pub ops_applied: u64,
    pub ops_dropped: u64,
    pub forbidden_attempts: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        intents: intent_lock().clone(),
        llm_retries: LLM_RETRIES.load(Ordering::Relaxed),
        llm_failures: LLM_FAILURES.load(Ordering::Relaxed),
        ops_applied: OPS_APPLIED.load(Ordering::Relaxed),
        ops_dropped: OPS_DROPPED.load(Ordering::Relaxed),
        forbidden_attempts: FORBIDDEN_ATTEMPTS.load(Ordering::Relaxed),
    }
}
