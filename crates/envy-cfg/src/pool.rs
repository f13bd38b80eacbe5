//! Append-only cfg pool
//!
//! All cfgs parsed during an engine run live in one pool and are referred to
//! by `CfgId` index. The pool only ever grows, so ids handed out remain
//! valid for the engine's lifetime and parent/weak back-edges cannot form
//! ownership cycles.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::PackageCfg;

/// Stable index of a cfg in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CfgId(usize);

impl CfgId {
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0
    }
}

/// Process-wide storage for parsed cfgs.
#[derive(Debug, Default)]
pub struct CfgPool {
    entries: RwLock<Vec<Arc<PackageCfg>>>,
}

impl CfgPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a cfg and return its id together with a shared handle.
    pub fn emplace(&self, cfg: PackageCfg) -> (CfgId, Arc<PackageCfg>) {
        let cfg = Arc::new(cfg);
        let mut entries = self.entries.write();
        let id = CfgId(entries.len());
        entries.push(Arc::clone(&cfg));
        (id, cfg)
    }

    /// Look up a cfg by id.
    #[must_use]
    pub fn get(&self, id: CfgId) -> Option<Arc<PackageCfg>> {
        self.entries.read().get(id.0).map(Arc::clone)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
