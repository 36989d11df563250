//! State every handle carries, and the callback slot type.

use std::cell::{Cell, RefCell};

use tracing::{debug, trace};

use super::{HandleKind, HandleState};
use crate::capability::{CapabilityToken, PermissionError};
use crate::error::NativeError;
use crate::reactor::{HandleId, ReactorContext};

/// Reasons a handle is active.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Activity {
    Reading = 1,
    Listening = 2,
    Running = 4,
}

pub(crate) struct HandleCore {
    ctx: ReactorContext,
    id: HandleId,
    kind: HandleKind,
    state: Cell<HandleState>,
    token: CapabilityToken,
    referenced: Cell<bool>,
    activity: Cell<u8>,
    requests: Cell<usize>,
    counted: Cell<bool>,
    poisoned: Cell<bool>,
}

impl HandleCore {
    /// Checks that the bridge may own a handle of this kind.
    pub fn new(
        ctx: &ReactorContext,
        kind: HandleKind,
        token: CapabilityToken,
    ) -> Result<Self, PermissionError> {
        ctx.gate().authorize_create(kind.as_str())?;
        let id = ctx.next_handle_id();
        debug!(handle = %id, %kind, "handle created");
        Ok(Self {
            ctx: ctx.clone(),
            id,
            kind,
            state: Cell::new(HandleState::Created),
            token,
            referenced: Cell::new(true),
            activity: Cell::new(0),
            requests: Cell::new(0),
            counted: Cell::new(false),
            poisoned: Cell::new(false),
        })
    }

    pub fn ctx(&self) -> &ReactorContext {
        &self.ctx
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn token(&self) -> CapabilityToken {
        self.token
    }

    pub fn state(&self) -> HandleState {
        self.state.get()
    }

    pub fn set_state(&self, state: HandleState) {
        trace!(handle = %self.id, from = ?self.state.get(), to = ?state, "state change");
        self.state.set(state);
        self.sync();
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state(), HandleState::Closing | HandleState::Closed)
    }

    /// `EBADF` once closing, closed, or poisoned by a failed listen.
    pub fn ensure_open(&self) -> Result<(), NativeError> {
        if self.is_closing() || self.poisoned.get() {
            return Err(NativeError::bad_descriptor());
        }
        Ok(())
    }

    pub fn poison(&self) {
        self.poisoned.set(true);
    }

    pub fn set_active(&self, activity: Activity, on: bool) {
        let bits = self.activity.get();
        let bits = if on {
            bits | activity as u8
        } else {
            bits & !(activity as u8)
        };
        self.activity.set(bits);
        self.sync();
    }

    pub fn is_active(&self) -> bool {
        self.activity.get() != 0 || self.requests.get() > 0
    }

    pub fn add_request(&self) {
        self.requests.set(self.requests.get() + 1);
        self.sync();
    }

    pub fn finish_request(&self) {
        self.requests.set(self.requests.get().saturating_sub(1));
        self.sync();
    }

    pub fn set_ref(&self, referenced: bool) {
        self.referenced.set(referenced);
        self.sync();
    }

    pub fn has_ref(&self) -> bool {
        self.referenced.get()
    }

    /// Moves to `Closing`. Returns `false` if the handle was already closing.
    pub fn begin_close(&self) -> bool {
        if self.is_closing() {
            debug!(handle = %self.id, "close on a closing handle ignored");
            return false;
        }
        debug!(handle = %self.id, kind = %self.kind, "closing");
        self.activity.set(0);
        self.set_state(HandleState::Closing);
        true
    }

    /// Moves to `Closed` and drops the registry's reference. The caller must
    /// hold its own `Rc` to the handle.
    pub fn finish_close(&self) {
        self.requests.set(0);
        self.set_state(HandleState::Closed);
        let handle = self.ctx.registry().remove(self.id);
        drop(handle);
        debug!(handle = %self.id, "closed");
    }

    /// Pending requests keep the loop alive even when unreferenced.
    fn sync(&self) {
        let want = self.state.get() != HandleState::Closed
            && ((self.referenced.get() && self.activity.get() != 0) || self.requests.get() > 0);
        if want != self.counted.get() {
            self.counted.set(want);
            self.ctx.adjust_alive(want);
        }
    }
}

impl Drop for HandleCore {
    fn drop(&mut self) {
        if self.counted.get() {
            self.ctx.adjust_alive(false);
        }
    }
}

/// Holds a user callback that may be invoked re-entrantly.
///
/// The callback is taken out while it runs, so it may freely call back into
/// its handle, including replacing itself. A sealed slot (closed handle)
/// drops its callback and ignores new ones.
pub(crate) struct Slot<F: ?Sized> {
    cell: RefCell<Option<Box<F>>>,
    sealed: Cell<bool>,
}

impl<F: ?Sized> Slot<F> {
    pub fn new() -> Self {
        Self {
            cell: RefCell::new(None),
            sealed: Cell::new(false),
        }
    }

    pub fn set(&self, callback: Box<F>) {
        if self.sealed.get() {
            return;
        }
        let old = self.cell.borrow_mut().replace(callback);
        drop(old);
    }

    pub fn is_set(&self) -> bool {
        self.cell.borrow().is_some()
    }

    /// Runs `call` with the callback, if any.
    pub fn with<R>(&self, call: impl FnOnce(&mut F) -> R) -> Option<R> {
        let mut callback = self.cell.borrow_mut().take()?;
        let out = call(&mut *callback);
        if !self.sealed.get() {
            let mut cell = self.cell.borrow_mut();
            if cell.is_none() {
                *cell = Some(callback);
            }
        }
        Some(out)
    }

    pub fn seal(&self) {
        self.sealed.set(true);
        let old = self.cell.borrow_mut().take();
        drop(old);
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    #[test]
    fn slot_survives_reentrant_replace() {
        let slot: Rc<Slot<dyn FnMut() -> u32>> = Rc::new(Slot::new());
        let inner = slot.clone();
        slot.set(Box::new(move || {
            inner.set(Box::new(|| 2));
            1
        }));
        assert_eq!(slot.with(|cb| cb()), Some(1));
        assert_eq!(slot.with(|cb| cb()), Some(2));
        assert_eq!(slot.with(|cb| cb()), Some(2));
    }

    #[test]
    fn sealed_slot_ignores_set() {
        let slot: Slot<dyn FnMut()> = Slot::new();
        slot.set(Box::new(|| {}));
        slot.seal();
        slot.set(Box::new(|| {}));
        assert!(!slot.is_set());
        assert!(slot.with(|cb| cb()).is_none());
    }
}
