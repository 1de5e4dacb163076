//! Client context table.
//!
//! A context is the handle a client uses to refer to its own session with
//! the daemon. Each connection may hold at most one; the table maps context
//! ids back to the worker slot that owns them so one client can never use
//! another's context.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::error::ErrorClass;
use crate::pool::SlotId;

pub type ContextId = u32;

/// Context id clients send before they have opened one.
pub const NO_CONTEXT: ContextId = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("context {0:#x} is not open on this connection")]
    Unknown(ContextId),

    #[error("connection already holds context {0:#x}")]
    AlreadyOpen(ContextId),
}

impl ContextError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Protocol
    }
}

#[derive(Default)]
struct ContextState {
    last: ContextId,
    owners: HashMap<ContextId, SlotId>,
    by_slot: HashMap<SlotId, ContextId>,
}

impl ContextState {
    fn next_free(&mut self) -> ContextId {
        loop {
            self.last = self.last.wrapping_add(1);
            if self.last != NO_CONTEXT && !self.owners.contains_key(&self.last) {
                return self.last;
            }
        }
    }
}

#[derive(Default)]
pub struct ContextTable {
    state: Mutex<ContextState>,
}

impl ContextTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open(&self, slot: SlotId) -> Result<ContextId, ContextError> {
        let mut state = self.lock();
        if let Some(&existing) = state.by_slot.get(&slot) {
            return Err(ContextError::AlreadyOpen(existing));
        }
        let context = state.next_free();
        state.owners.insert(context, slot);
        state.by_slot.insert(slot, context);
        Ok(context)
    }

    /// Succeeds only if `context` is open and owned by `slot`.
    pub fn verify(&self, slot: SlotId, context: ContextId) -> Result<(), ContextError> {
        match self.lock().owners.get(&context) {
            Some(&owner) if owner == slot => Ok(()),
            _ => Err(ContextError::Unknown(context)),
        }
    }

    pub fn close(&self, slot: SlotId, context: ContextId) -> Result<(), ContextError> {
        let mut state = self.lock();
        match state.owners.get(&context) {
            Some(&owner) if owner == slot => {
                state.owners.remove(&context);
                state.by_slot.remove(&slot);
                Ok(())
            }
            _ => Err(ContextError::Unknown(context)),
        }
    }

    /// Drops whatever context `slot` still holds.
    pub fn release_slot(&self, slot: SlotId) -> Option<ContextId> {
        let mut state = self.lock();
        let context = state.by_slot.remove(&slot)?;
        state.owners.remove(&context);
        Some(context)
    }

    pub fn len(&self) -> usize {
        self.lock().owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
