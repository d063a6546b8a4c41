//! The slot table: vref to live-object resolution.
//!
//! The table answers one question, "is there a live handle for this
//! vref, and if so which one", without itself retaining anything. Each
//! entry holds the object's core weakly; the core's destructor removes
//! its own entry, so the table never accumulates stale rows and a hit
//! always upgrades.
//!
//! Representatives are keyed by base ref. Resolving a faceted slot
//! therefore means looking up the cohort's core and wrapping it in a
//! facet view, which is also where facet indices from the wire get
//! bounds-checked.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::error::{SlotError, StateError};
use crate::handle::{ObjCore, ObjHandle};
use crate::slot::{VatSlot, Vref};

#[derive(Default)]
pub(crate) struct SlotTable {
    entries: RefCell<HashMap<Vref, Weak<ObjCore>>>,
}

impl SlotTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record `core` as the one live object for `vref` (a base ref for
    /// representatives). Fails if a live object already claims the vref:
    /// handing out two representatives for one instance would split its
    /// identity.
    pub(crate) fn register_value(
        &self,
        vref: &Vref,
        core: &Rc<ObjCore>,
    ) -> Result<(), StateError> {
        let mut entries = self.entries.borrow_mut();
        if let Some(existing) = entries.get(vref) {
            if existing.upgrade().is_some() {
                return Err(StateError::AlreadyRepresented(vref.to_string()));
            }
        }
        entries.insert(vref.clone(), Rc::downgrade(core));
        Ok(())
    }

    /// The live core registered under `vref`, if any.
    pub(crate) fn live_core(&self, vref: &Vref) -> Option<Rc<ObjCore>> {
        self.entries.borrow().get(vref)?.upgrade()
    }

    /// True when a live object claims `vref`.
    pub(crate) fn has_live(&self, vref: &Vref) -> bool {
        self.live_core(vref).is_some()
    }

    /// Resolve a parsed slot to a handle on its live object.
    ///
    /// `Ok(None)` means no live object claims it (the caller decides
    /// whether to reanimate, import, or fail). Facet indices are checked
    /// against the cohort's shape.
    pub(crate) fn lookup(&self, slot: &VatSlot) -> Result<Option<ObjHandle>, SlotError> {
        let Some(core) = self.live_core(&slot.base_ref) else {
            return Ok(None);
        };
        let whole = ObjHandle::from_parts(core, None);
        Ok(Some(whole.facet_view(slot.facet)?))
    }

    /// Remove the entry for `vref`, but only if it still points at the
    /// core located at `ptr`. Called from core destructors.
    pub(crate) fn remove_if(&self, vref: &Vref, ptr: usize) {
        let mut entries = self.entries.borrow_mut();
        if let Some(existing) = entries.get(vref) {
            if existing.as_ptr() as usize == ptr {
                entries.remove(vref);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::GcHooks;
    use crate::slot::parse_vat_slot;
    use std::collections::BTreeSet;

    fn table_and_hooks() -> (Rc<SlotTable>, GcHooks) {
        let table = Rc::new(SlotTable::new());
        let hooks = GcHooks {
            possibly_dead: Rc::new(RefCell::new(BTreeSet::new())),
            table: Rc::downgrade(&table),
            cache: Weak::new(),
        };
        (table, hooks)
    }

    #[test]
    fn register_then_resolve() {
        let (table, hooks) = table_and_hooks();
        let vref = Vref::from("o-7");
        let handle = ObjHandle::presence(vref.clone(), hooks);
        table.register_value(&vref, &handle.core).unwrap();

        let slot = parse_vat_slot("o-7").unwrap();
        let found = table.lookup(&slot).unwrap().unwrap();
        assert_eq!(found, handle);
        assert!(table.has_live(&vref));
    }

    #[test]
    fn second_live_registration_is_rejected() {
        let (table, hooks) = table_and_hooks();
        let vref = Vref::from("o-7");
        let first = ObjHandle::presence(vref.clone(), hooks.clone());
        table.register_value(&vref, &first.core).unwrap();

        let second = ObjHandle::presence(vref.clone(), hooks);
        let err = table.register_value(&vref, &second.core).unwrap_err();
        assert!(matches!(err, StateError::AlreadyRepresented(v) if v == "o-7"));
    }

    #[test]
    fn drop_clears_the_entry_and_allows_reregistration() {
        let (table, hooks) = table_and_hooks();
        let vref = Vref::from("o-7");
        let first = ObjHandle::presence(vref.clone(), hooks.clone());
        table.register_value(&vref, &first.core).unwrap();
        drop(first);
        assert_eq!(table.len(), 0);

        let second = ObjHandle::presence(vref.clone(), hooks);
        table.register_value(&vref, &second.core).unwrap();
        assert!(table.has_live(&vref));
    }

    #[test]
    fn facet_on_an_unfaceted_object_is_an_error() {
        let (table, hooks) = table_and_hooks();
        let vref = Vref::from("o-7");
        let handle = ObjHandle::presence(vref.clone(), hooks);
        table.register_value(&vref, &handle.core).unwrap();

        let mut slot = parse_vat_slot("o-7").unwrap();
        slot.facet = Some(0);
        assert!(matches!(
            table.lookup(&slot),
            Err(SlotError::UnexpectedFacet(_))
        ));
    }
}
