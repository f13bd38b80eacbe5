//! Per-package runtime state
//!
//! One `PackageRecord` exists per distinct canonical key encountered during
//! a run. The record is the synchronization point between the package's own
//! worker and every dependent: phase advancement, failure, and result
//! publication all happen under one mutex and signal one condvar.
//!
//! Target phases are a monotone high-water mark. Promotion uses
//! compare-and-raise under the lock; requests for a lower target are
//! idempotent no-ops, and demotion is impossible by construction.

use camino::Utf8PathBuf;
use envy_cache::EntryGuard;
use envy_cfg::{CfgId, PackageCfg};
use envy_key::CanonicalKey;
use envy_phases::Phase;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::EnvyError;

#[derive(Debug)]
struct RecordState {
    current: Phase,
    target: Phase,
    error: Option<Arc<EnvyError>>,
    asset_path: Option<Utf8PathBuf>,
    /// BLAKE3 hex of the installed tree; empty until install succeeds.
    result_hash: String,
    products: HashMap<String, String>,
    declared_dependencies: Vec<CanonicalKey>,
    /// Entry lock held from check through deploy while installing.
    entry: Option<EntryGuard>,
}

/// Runtime state for one package in flight.
#[derive(Debug)]
pub struct PackageRecord {
    key: CanonicalKey,
    cfg_id: CfgId,
    cfg: Arc<PackageCfg>,
    state: Mutex<RecordState>,
    advanced: Condvar,
}

impl PackageRecord {
    pub(crate) fn new(
        key: CanonicalKey,
        cfg_id: CfgId,
        cfg: Arc<PackageCfg>,
        target: Phase,
    ) -> Self {
        Self {
            key,
            cfg_id,
            cfg,
            state: Mutex::new(RecordState {
                current: Phase::None,
                target,
                error: None,
                asset_path: None,
                result_hash: String::new(),
                products: HashMap::new(),
                declared_dependencies: Vec::new(),
                entry: None,
            }),
            advanced: Condvar::new(),
        }
    }

    #[must_use]
    pub fn key(&self) -> &CanonicalKey {
        &self.key
    }

    #[must_use]
    pub fn cfg(&self) -> &Arc<PackageCfg> {
        &self.cfg
    }

    #[must_use]
    pub fn cfg_id(&self) -> CfgId {
        self.cfg_id
    }

    #[must_use]
    pub fn current_phase(&self) -> Phase {
        self.state.lock().current
    }

    #[must_use]
    pub fn target_phase(&self) -> Phase {
        self.state.lock().target
    }

    /// Lift the target phase to at least `phase`; lower requests are
    /// idempotent. Waiters are signaled on every effective promotion.
    pub fn request_target(&self, phase: Phase) -> bool {
        let mut state = self.state.lock();
        if phase > state.target {
            state.target = phase;
            self.advanced.notify_all();
            true
        } else {
            false
        }
    }

    /// Record a successful transition into `phase`.
    pub(crate) fn advance_to(&self, phase: Phase) {
        let mut state = self.state.lock();
        debug_assert!(phase > state.current, "phase demotion is forbidden");
        state.current = phase;
        self.advanced.notify_all();
    }

    /// Record a package-fatal failure and wake every waiter.
    pub(crate) fn fail(&self, error: Arc<EnvyError>) {
        // A failed record never advances again; discard the held entry lock
        // so its staging area rolls back. The guard's drop does filesystem
        // work, so it runs outside the state lock.
        let entry = {
            let mut state = self.state.lock();
            if state.error.is_none() {
                state.error = Some(error);
            }
            self.advanced.notify_all();
            state.entry.take()
        };
        drop(entry);
    }

    #[must_use]
    pub fn error(&self) -> Option<Arc<EnvyError>> {
        self.state.lock().error.clone()
    }

    /// Block until this package has reached `phase` (or beyond), or failed.
    pub fn wait_for_phase(&self, phase: Phase) -> Result<(), Arc<EnvyError>> {
        let mut state = self.state.lock();
        loop {
            if let Some(error) = &state.error {
                return Err(Arc::clone(error));
            }
            if state.current >= phase {
                return Ok(());
            }
            self.advanced.wait(&mut state);
        }
    }

    /// Block until the target rises above `known_target`, or the record
    /// terminates. Returns the target in effect on wakeup.
    pub(crate) fn wait_for_target_above(&self, known_target: Phase) -> Phase {
        let mut state = self.state.lock();
        while state.target <= known_target && state.error.is_none() && state.current < Phase::Completion
        {
            self.advanced.wait(&mut state);
        }
        state.target
    }

    pub(crate) fn set_asset_path(&self, path: Utf8PathBuf) {
        self.state.lock().asset_path = Some(path);
    }

    #[must_use]
    pub fn asset_path(&self) -> Option<Utf8PathBuf> {
        self.state.lock().asset_path.clone()
    }

    pub(crate) fn set_result_hash(&self, hash: String) {
        self.state.lock().result_hash = hash;
    }

    /// Empty until the install phase has produced a digest.
    #[must_use]
    pub fn result_hash(&self) -> String {
        self.state.lock().result_hash.clone()
    }

    pub(crate) fn set_products(&self, products: HashMap<String, String>) {
        self.state.lock().products = products;
    }

    #[must_use]
    pub fn product(&self, name: &str) -> Option<String> {
        self.state.lock().products.get(name).cloned()
    }

    pub(crate) fn set_declared_dependencies(&self, deps: Vec<CanonicalKey>) {
        self.state.lock().declared_dependencies = deps;
    }

    #[must_use]
    pub fn declared_dependencies(&self) -> Vec<CanonicalKey> {
        self.state.lock().declared_dependencies.clone()
    }

    pub(crate) fn hold_entry(&self, guard: EntryGuard) {
        self.state.lock().entry = Some(guard);
    }

    pub(crate) fn take_entry(&self) -> Option<EntryGuard> {
        self.state.lock().entry.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use envy_cfg::{CfgPool, PackageSource};
    use std::time::Duration;

    fn record(target: Phase) -> Arc<PackageRecord> {
        let pool = CfgPool::new();
        let (cfg_id, cfg) = pool.emplace(PackageCfg {
            identity: "a.tool@1".to_string(),
            source: PackageSource::WeakRef,
            serialized_options: "{}".to_string(),
            needed_by: None,
            parent: None,
            weak: None,
            product: None,
            declaring_file_path: Utf8PathBuf::from("/manifest.lua"),
        });
        let key = cfg.canonical_key().unwrap();
        Arc::new(PackageRecord::new(key, cfg_id, cfg, target))
    }

    #[test]
    fn target_promotion_is_monotone_and_idempotent() {
        let record = record(Phase::Check);

        assert!(record.request_target(Phase::Build));
        assert_eq!(record.target_phase(), Phase::Build);

        // Lower and equal requests change nothing.
        assert!(!record.request_target(Phase::Fetch));
        assert!(!record.request_target(Phase::Build));
        assert_eq!(record.target_phase(), Phase::Build);

        assert!(record.request_target(Phase::Completion));
        assert_eq!(record.target_phase(), Phase::Completion);
    }

    #[test]
    fn waiters_observe_phase_advancement() {
        let record = record(Phase::Completion);

        let waiter = {
            let record = Arc::clone(&record);
            std::thread::spawn(move || record.wait_for_phase(Phase::Stage))
        };

        record.advance_to(Phase::RecipeFetch);
        record.advance_to(Phase::Check);
        record.advance_to(Phase::Fetch);
        record.advance_to(Phase::Stage);

        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn failure_wakes_waiters_with_the_error() {
        let record = record(Phase::Completion);

        let waiter = {
            let record = Arc::clone(&record);
            std::thread::spawn(move || record.wait_for_phase(Phase::Completion))
        };

        std::thread::sleep(Duration::from_millis(20));
        record.fail(Arc::new(EnvyError::Build("exit code 2".to_string())));

        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(*err, EnvyError::Build(_)));
    }

    #[test]
    fn results_are_published_before_completion() {
        let record = record(Phase::Completion);

        let reader = {
            let record = Arc::clone(&record);
            std::thread::spawn(move || {
                record.wait_for_phase(Phase::Completion).unwrap();
                record.result_hash()
            })
        };

        for phase in [
            Phase::RecipeFetch,
            Phase::Check,
            Phase::Fetch,
            Phase::Stage,
            Phase::Build,
            Phase::Install,
        ] {
            record.advance_to(phase);
        }
        record.set_result_hash("abc123".to_string());
        record.advance_to(Phase::Deploy);
        record.advance_to(Phase::Completion);

        assert_eq!(reader.join().unwrap(), "abc123");
    }

    #[test]
    fn target_wait_returns_on_promotion() {
        let record = record(Phase::Check);

        let waiter = {
            let record = Arc::clone(&record);
            std::thread::spawn(move || record.wait_for_target_above(Phase::Check))
        };

        std::thread::sleep(Duration::from_millis(20));
        record.request_target(Phase::Deploy);

        assert_eq!(waiter.join().unwrap(), Phase::Deploy);
    }
}
