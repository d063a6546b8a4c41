//! Weak collections that do not retain their keys.
//!
//! A plain RAM-side weak map would defeat virtualization: a virtual
//! object's representative comes and goes, so keying on the handle would
//! silently drop entries whenever the representative is reclaimed, and
//! holding the handle would pin the object in memory forever. These
//! wrappers therefore split keys by how the object is recognized:
//!
//! - Keys with a recognizing vref (virtual objects, durable objects,
//!   imports) are indexed by that vref in an ordinary strong map. The
//!   collection registers itself as a recognizer with the reference
//!   manager, which deletes the entry if the key is ever garbage
//!   collected or retired, so the strong map cannot leak.
//! - Everything else (remotables, promises, vref-less handles) is keyed
//!   by handle identity and held through a host weak reference; dead
//!   entries are purged lazily on access.
//! - Facet cohort records are the exception: they are held strongly for
//!   the collection's lifetime, so holding a nominally weak grip on one
//!   fragment of a virtual object cannot be used to observe collection.
//!
//! Dropping the whole collection withdraws every recognition record it
//! registered, letting now-unrecognized imports retire.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::{Rc, Weak};

use crate::codec::Value;
use crate::handle::{HandleKey, ObjCore, ObjHandle};
use crate::refs::{Recognizer, ReferenceManager};
use crate::slot::Vref;

fn entry_holds_key(core: &Weak<ObjCore>, key: &ObjHandle) -> bool {
    // An address match alone is not enough: the original core may have
    // died and its address been reused.
    core.upgrade().is_some_and(|live| Rc::ptr_eq(&live, &key.core))
}

struct RamEntry {
    core: Weak<ObjCore>,
    value: Value,
}

/// A WeakMap stand-in whose keys may be virtual objects.
pub struct VatWeakMap {
    refs: Rc<ReferenceManager>,
    /// Entries for vref-recognized keys.
    vmap: Rc<RefCell<BTreeMap<Vref, Value>>>,
    /// Entries for identity-recognized keys, weakly held.
    ram: RefCell<HashMap<HandleKey, RamEntry>>,
    /// Cohort keys, strongly held.
    pinned: RefCell<HashMap<HandleKey, (ObjHandle, Value)>>,
}

impl VatWeakMap {
    pub(crate) fn new(refs: Rc<ReferenceManager>) -> Self {
        Self {
            refs,
            vmap: Rc::new(RefCell::new(BTreeMap::new())),
            ram: RefCell::new(HashMap::new()),
            pinned: RefCell::new(HashMap::new()),
        }
    }

    fn recognizer(&self) -> Recognizer {
        Recognizer::Map(Rc::clone(&self.vmap))
    }

    /// Insert or overwrite the entry for `key`.
    pub fn set(&self, key: &ObjHandle, value: Value) {
        if let Some(vref) = key.vref_key() {
            self.refs.add_recognizable_value(key, &self.recognizer());
            self.vmap.borrow_mut().insert(vref, value);
        } else if key.is_cohort() {
            self.pinned
                .borrow_mut()
                .insert(key.key(), (key.clone(), value));
        } else {
            self.ram.borrow_mut().insert(
                key.key(),
                RamEntry {
                    core: Rc::downgrade(&key.core),
                    value,
                },
            );
        }
    }

    /// The value stored under `key`, if any.
    pub fn get(&self, key: &ObjHandle) -> Option<Value> {
        if let Some(vref) = key.vref_key() {
            return self.vmap.borrow().get(&vref).cloned();
        }
        if key.is_cohort() {
            return self
                .pinned
                .borrow()
                .get(&key.key())
                .map(|(_, value)| value.clone());
        }
        let mut ram = self.ram.borrow_mut();
        match ram.get(&key.key()) {
            Some(entry) if entry_holds_key(&entry.core, key) => Some(entry.value.clone()),
            Some(_) => {
                ram.remove(&key.key());
                None
            }
            None => None,
        }
    }

    /// Whether an entry for `key` exists.
    pub fn has(&self, key: &ObjHandle) -> bool {
        self.get(key).is_some()
    }

    /// Remove the entry for `key`. Returns whether one existed.
    pub fn delete(&self, key: &ObjHandle) -> bool {
        if let Some(vref) = key.vref_key() {
            let removed = self.vmap.borrow_mut().remove(&vref).is_some();
            if removed {
                self.refs
                    .remove_recognizable_value(key, &self.recognizer());
            }
            return removed;
        }
        if key.is_cohort() {
            return self.pinned.borrow_mut().remove(&key.key()).is_some();
        }
        let mut ram = self.ram.borrow_mut();
        match ram.remove(&key.key()) {
            Some(entry) => entry_holds_key(&entry.core, key),
            None => false,
        }
    }

    /// Diagnostic count of vref-recognized entries.
    pub fn vref_key_count(&self) -> usize {
        self.vmap.borrow().len()
    }

    /// Diagnostic count of identity-recognized entries still live.
    pub fn ram_key_count(&self) -> usize {
        let mut ram = self.ram.borrow_mut();
        ram.retain(|_, entry| entry.core.upgrade().is_some());
        ram.len() + self.pinned.borrow().len()
    }
}

impl Drop for VatWeakMap {
    fn drop(&mut self) {
        let recognizer = self.recognizer();
        let vrefs: Vec<Vref> = self.vmap.borrow().keys().cloned().collect();
        for vref in vrefs {
            self.refs.remove_recognizable_vref(&vref, &recognizer);
        }
    }
}

/// A WeakSet stand-in whose members may be virtual objects.
pub struct VatWeakSet {
    refs: Rc<ReferenceManager>,
    vset: Rc<RefCell<BTreeSet<Vref>>>,
    ram: RefCell<HashMap<HandleKey, Weak<ObjCore>>>,
    pinned: RefCell<HashMap<HandleKey, ObjHandle>>,
}

impl VatWeakSet {
    pub(crate) fn new(refs: Rc<ReferenceManager>) -> Self {
        Self {
            refs,
            vset: Rc::new(RefCell::new(BTreeSet::new())),
            ram: RefCell::new(HashMap::new()),
            pinned: RefCell::new(HashMap::new()),
        }
    }

    fn recognizer(&self) -> Recognizer {
        Recognizer::Set(Rc::clone(&self.vset))
    }

    /// Add `key` to the set.
    pub fn add(&self, key: &ObjHandle) {
        if let Some(vref) = key.vref_key() {
            self.refs.add_recognizable_value(key, &self.recognizer());
            self.vset.borrow_mut().insert(vref);
        } else if key.is_cohort() {
            self.pinned.borrow_mut().insert(key.key(), key.clone());
        } else {
            self.ram
                .borrow_mut()
                .insert(key.key(), Rc::downgrade(&key.core));
        }
    }

    /// Whether `key` is in the set.
    pub fn has(&self, key: &ObjHandle) -> bool {
        if let Some(vref) = key.vref_key() {
            return self.vset.borrow().contains(&vref);
        }
        if key.is_cohort() {
            return self.pinned.borrow().contains_key(&key.key());
        }
        let mut ram = self.ram.borrow_mut();
        match ram.get(&key.key()) {
            Some(core) if entry_holds_key(core, key) => true,
            Some(_) => {
                ram.remove(&key.key());
                false
            }
            None => false,
        }
    }

    /// Remove `key` from the set. Returns whether it was a member.
    pub fn delete(&self, key: &ObjHandle) -> bool {
        if let Some(vref) = key.vref_key() {
            let removed = self.vset.borrow_mut().remove(&vref);
            if removed {
                self.refs
                    .remove_recognizable_value(key, &self.recognizer());
            }
            return removed;
        }
        if key.is_cohort() {
            return self.pinned.borrow_mut().remove(&key.key()).is_some();
        }
        let mut ram = self.ram.borrow_mut();
        match ram.remove(&key.key()) {
            Some(core) => entry_holds_key(&core, key),
            None => false,
        }
    }

    /// Diagnostic count of vref-recognized members.
    pub fn vref_key_count(&self) -> usize {
        self.vset.borrow().len()
    }

    /// Diagnostic count of identity-recognized members still live.
    pub fn ram_key_count(&self) -> usize {
        let mut ram = self.ram.borrow_mut();
        ram.retain(|_, core| core.upgrade().is_some());
        ram.len() + self.pinned.borrow().len()
    }
}

impl Drop for VatWeakSet {
    fn drop(&mut self) {
        let recognizer = self.recognizer();
        let vrefs: Vec<Vref> = self.vset.borrow().iter().cloned().collect();
        for vref in vrefs {
            self.refs.remove_recognizable_vref(&vref, &recognizer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::GcHooks;
    use crate::store::MemoryVatStore;
    use crate::table::SlotTable;
    use serde_json::json;

    fn manager() -> (Rc<ReferenceManager>, Rc<RefCell<BTreeSet<Vref>>>) {
        let store = Rc::new(MemoryVatStore::new());
        let table = Rc::new(SlotTable::new());
        let retired = Rc::new(RefCell::new(BTreeSet::new()));
        let gc = GcHooks {
            possibly_dead: Rc::new(RefCell::new(BTreeSet::new())),
            table: Rc::downgrade(&table),
            cache: std::rc::Weak::new(),
        };
        let refs = Rc::new(ReferenceManager::new(
            store as Rc<dyn crate::store::VatStore>,
            table,
            gc,
            Rc::clone(&retired),
            false,
        ));
        (refs, retired)
    }

    #[test]
    fn import_keys_are_indexed_by_vref_and_recognized() {
        let (refs, _retired) = manager();
        let map = VatWeakMap::new(Rc::clone(&refs));
        let import = ObjHandle::presence(Vref::from("o-3"), refs.gc_hooks());

        map.set(&import, Value::data(json!("hello")));
        assert_eq!(refs.recognizers_len(), 1);
        assert_eq!(map.vref_key_count(), 1);

        // A different handle with the same vref finds the entry.
        let again = ObjHandle::presence(Vref::from("o-3"), refs.gc_hooks());
        assert_eq!(map.get(&again).unwrap().body(), &json!("hello"));

        assert!(map.delete(&import));
        assert_eq!(refs.recognizers_len(), 0);
        assert!(!map.has(&import));
    }

    #[test]
    fn remotable_keys_are_weak_and_purge_on_death() {
        let (refs, _retired) = manager();
        let map = VatWeakMap::new(Rc::clone(&refs));
        let key = ObjHandle::remotable("ephemeral", refs.gc_hooks());

        map.set(&key, Value::data(json!(1)));
        assert_eq!(refs.recognizers_len(), 0, "RAM keys need no recognizer");
        assert!(map.has(&key));
        assert_eq!(map.ram_key_count(), 1);

        let probe = key.clone();
        drop(key);
        assert!(map.has(&probe), "a live clone keeps the entry");
        drop(probe);
        assert_eq!(map.ram_key_count(), 0);
    }

    #[test]
    fn dropping_the_collection_withdraws_recognition() {
        let (refs, retired) = manager();
        let set = VatWeakSet::new(Rc::clone(&refs));
        let import = ObjHandle::presence(Vref::from("o-7"), refs.gc_hooks());

        set.add(&import);
        assert_eq!(refs.recognizers_len(), 1);
        drop(set);
        assert_eq!(refs.recognizers_len(), 0);
        assert!(
            retired.borrow().contains(&Vref::from("o-7")),
            "the import lost its last recognizer"
        );
    }

    #[test]
    fn two_collections_recognize_independently() {
        let (refs, _retired) = manager();
        let a = VatWeakSet::new(Rc::clone(&refs));
        let b = VatWeakSet::new(Rc::clone(&refs));
        let import = ObjHandle::presence(Vref::from("o-9"), refs.gc_hooks());

        a.add(&import);
        b.add(&import);
        assert!(a.delete(&import));
        assert!(
            refs.is_vref_recognizable(&Vref::from("o-9")),
            "the other set still recognizes it"
        );
        assert!(b.has(&import));
    }
}
