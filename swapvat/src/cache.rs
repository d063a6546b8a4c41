//! Bounded LRU cache of state records.
//!
//! Each entry ("inner self") carries one object's raw state keyed by
//! base ref, a dirty bit, and whether a representative for it is
//! currently live. Reads and writes go through the cache so hot objects
//! avoid store round-trips; eviction is write-through, so the store row
//! is authoritative whenever an entry is not resident.
//!
//! Recency is the map order of an [`IndexMap`]: front is
//! least-recently-used, back is most-recently-used, and every access
//! re-inserts at the back. The cache never holds more than `capacity`
//! entries once an operation returns; capacity zero is legal and turns
//! every access into a store round-trip.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::trace;

use crate::codec::CapData;
use crate::error::StateError;
use crate::slot::Vref;
use crate::store::{keys, VatStore};

/// One object's persisted state: field name to serialized value.
pub(crate) type RawState = BTreeMap<String, CapData>;

#[derive(Default)]
struct Inner {
    raw_state: Option<RawState>,
    dirty: bool,
    rep_live: bool,
}

pub(crate) struct StateCache {
    store: Rc<dyn VatStore>,
    capacity: usize,
    entries: RefCell<IndexMap<Vref, Inner>>,
}

impl StateCache {
    pub(crate) fn new(store: Rc<dyn VatStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity,
            entries: RefCell::new(IndexMap::new()),
        }
    }

    fn load(&self, base_ref: &Vref) -> Result<RawState, StateError> {
        let Some(raw) = self.store.get(&keys::state(base_ref)) else {
            return Err(StateError::MissingState(base_ref.to_string()));
        };
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_back(&self, base_ref: &Vref, state: &RawState) -> Result<(), StateError> {
        let raw = serde_json::to_string(state)?;
        self.store.set(&keys::state(base_ref), &raw);
        Ok(())
    }

    fn trim(&self, entries: &mut IndexMap<Vref, Inner>) -> Result<(), StateError> {
        while entries.len() > self.capacity {
            let Some((base_ref, inner)) = entries.shift_remove_index(0) else {
                break;
            };
            trace!(base_ref = %base_ref, dirty = inner.dirty, "state cache eviction");
            if inner.dirty {
                if let Some(state) = &inner.raw_state {
                    self.write_back(&base_ref, state)?;
                }
            }
        }
        Ok(())
    }

    /// Run `f` against the object's state record with MRU placement,
    /// loading from the store on a miss.
    fn with_record<R>(
        &self,
        base_ref: &Vref,
        f: impl FnOnce(&mut RawState, &mut bool) -> Result<R, StateError>,
    ) -> Result<R, StateError> {
        let mut entries = self.entries.borrow_mut();
        let mut inner = entries.shift_remove(base_ref).unwrap_or_default();
        if inner.raw_state.is_none() {
            inner.raw_state = Some(self.load(base_ref)?);
        }
        let mut dirty = inner.dirty;
        let state = inner
            .raw_state
            .as_mut()
            .ok_or_else(|| StateError::MissingState(base_ref.to_string()))?;
        let result = f(state, &mut dirty);
        inner.dirty = dirty;
        entries.insert(base_ref.clone(), inner);
        self.trim(&mut entries)?;
        result
    }

    /// Read one field's serialized value.
    pub(crate) fn read_field(
        &self,
        base_ref: &Vref,
        field: &str,
    ) -> Result<CapData, StateError> {
        self.with_record(base_ref, |state, _dirty| {
            state
                .get(field)
                .cloned()
                .ok_or_else(|| StateError::UnknownField {
                    base_ref: base_ref.to_string(),
                    field: field.to_string(),
                })
        })
    }

    /// Replace one field's serialized value, returning the previous one.
    /// The field set is fixed at instantiation; unknown fields fail.
    pub(crate) fn replace_field(
        &self,
        base_ref: &Vref,
        field: &str,
        value: CapData,
    ) -> Result<CapData, StateError> {
        self.with_record(base_ref, |state, dirty| {
            let slot = state
                .get_mut(field)
                .ok_or_else(|| StateError::UnknownField {
                    base_ref: base_ref.to_string(),
                    field: field.to_string(),
                })?;
            let old = std::mem::replace(slot, value);
            *dirty = true;
            Ok(old)
        })
    }

    /// Adopt the initial state record of a freshly made instance. The
    /// entry starts dirty; nothing is written until eviction or flush.
    pub(crate) fn insert_record(
        &self,
        base_ref: &Vref,
        state: RawState,
    ) -> Result<(), StateError> {
        let mut entries = self.entries.borrow_mut();
        entries.insert(
            base_ref.clone(),
            Inner {
                raw_state: Some(state),
                dirty: true,
                rep_live: false,
            },
        );
        self.trim(&mut entries)
    }

    /// Remove the entry for `base_ref` without writing it back, and
    /// return the freshest known state: the cached record if resident,
    /// else whatever the store holds. `None` means neither exists.
    ///
    /// This is the deletion path. Reading the cache first means a dirty,
    /// never-flushed record still has its slots decref'd correctly, and
    /// dropping the entry unwritten means the row cannot be resurrected
    /// by a later flush.
    pub(crate) fn take_record(&self, base_ref: &Vref) -> Result<Option<RawState>, StateError> {
        let cached = self.entries.borrow_mut().shift_remove(base_ref);
        if let Some(inner) = cached {
            if inner.raw_state.is_some() {
                return Ok(inner.raw_state);
            }
        }
        match self.store.get(&keys::state(base_ref)) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Note that a representative for `base_ref` came alive, creating
    /// the entry if needed.
    pub(crate) fn mark_rep_live(&self, base_ref: &Vref) -> Result<(), StateError> {
        let mut entries = self.entries.borrow_mut();
        let mut inner = entries.shift_remove(base_ref).unwrap_or_default();
        inner.rep_live = true;
        entries.insert(base_ref.clone(), inner);
        self.trim(&mut entries)
    }

    /// Note that the last representative for `base_ref` dropped. Called
    /// from destructors, so it never loads or evicts.
    pub(crate) fn mark_rep_dropped(&self, base_ref: &Vref) {
        if let Some(inner) = self.entries.borrow_mut().get_mut(base_ref) {
            inner.rep_live = false;
        }
    }

    /// Whether a resident entry records a live representative.
    #[cfg(test)]
    pub(crate) fn rep_live(&self, base_ref: &Vref) -> bool {
        self.entries
            .borrow()
            .get(base_ref)
            .map(|inner| inner.rep_live)
            .unwrap_or(false)
    }

    /// Write all dirty entries and empty the cache, LRU-first.
    pub(crate) fn flush(&self) -> Result<(), StateError> {
        let mut entries = self.entries.borrow_mut();
        let count = entries.len();
        for (base_ref, inner) in entries.drain(..) {
            if inner.dirty {
                if let Some(state) = &inner.raw_state {
                    let raw = serde_json::to_string(state)?;
                    self.store.set(&keys::state(&base_ref), &raw);
                }
            }
        }
        trace!(count, "state cache flushed");
        Ok(())
    }

    /// Number of resident entries.
    pub(crate) fn resident_len(&self) -> usize {
        self.entries.borrow().len()
    }
}
