//! Process-scoped tables owned by a reactor: live handles, signal watchers
//! and in-flight off-thread operations.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::handle::{AnyHandle, HandleKind, HandleState};

/// Reactor-unique handle identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct HandleId(pub(crate) u64);

impl HandleId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Snapshot of one live handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandleInfo {
    pub id: HandleId,
    pub kind: HandleKind,
    pub state: HandleState,
    pub referenced: bool,
    pub active: bool,
}

pub(crate) type OpCallback = Box<dyn FnOnce(Box<dyn Any + Send>)>;

#[derive(Default)]
pub(crate) struct Registry {
    handles: BTreeMap<HandleId, AnyHandle>,
    signals: BTreeMap<i32, BTreeSet<HandleId>>,
    ops: BTreeMap<u64, OpCallback>,
    next_op: u64,
}

impl Registry {
    pub fn insert(&mut self, handle: AnyHandle) {
        self.handles.insert(handle.as_handle().id(), handle);
    }

    pub fn remove(&mut self, id: HandleId) -> Option<AnyHandle> {
        for watchers in self.signals.values_mut() {
            watchers.remove(&id);
        }
        self.signals.retain(|_, watchers| !watchers.is_empty());
        self.handles.remove(&id)
    }

    pub fn get(&self, id: HandleId) -> Option<AnyHandle> {
        self.handles.get(&id).cloned()
    }

    pub fn infos(&self) -> Vec<HandleInfo> {
        self.handles
            .values()
            .map(|handle| {
                let h = handle.as_handle();
                HandleInfo {
                    id: h.id(),
                    kind: h.kind(),
                    state: h.state(),
                    referenced: h.has_ref(),
                    active: h.is_active(),
                }
            })
            .collect()
    }

    pub fn watch_signal(&mut self, signum: i32, id: HandleId) {
        self.signals.entry(signum).or_default().insert(id);
    }

    pub fn unwatch_signal(&mut self, signum: i32, id: HandleId) {
        if let Some(watchers) = self.signals.get_mut(&signum) {
            watchers.remove(&id);
            if watchers.is_empty() {
                self.signals.remove(&signum);
            }
        }
    }

    pub fn signal_watchers(&self, signum: i32) -> Vec<HandleId> {
        self.signals
            .get(&signum)
            .map(|watchers| watchers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn insert_op(&mut self, callback: OpCallback) -> u64 {
        self.next_op += 1;
        self.ops.insert(self.next_op, callback);
        self.next_op
    }

    pub fn take_op(&mut self, op: u64) -> Option<OpCallback> {
        self.ops.remove(&op)
    }

    /// Empties every table, returning the handles so they can be dropped
    /// outside the borrow.
    pub fn clear(&mut self) -> Vec<AnyHandle> {
        self.signals.clear();
        self.ops.clear();
        std::mem::take(&mut self.handles).into_values().collect()
    }
}
