//! The vat store: an ordered key-value surface the vat persists into.
//!
//! The store itself belongs to the host (kernel, database, test harness);
//! this subsystem consumes a narrow synchronous trait and owns a handful
//! of key namespaces inside it:
//!
//! ```text
//! vom.<baseRef>                  serialized state record
//! vom.rc.<baseRef>               reference count (row absent == zero)
//! vom.es.<baseRef>               export status, one char per facet
//! vom.ir.<vref>|<recognizer>     persisted recognizer marker
//! vom.vkind.<id>.descriptor      virtual kind descriptor (diagnostic)
//! vom.dkind.<id>.descriptor      durable kind descriptor
//! vom.dkind.<id>.nextID          next instance number for a durable kind
//! kindIDID                       kind ID of the kind-handle kind
//! idCounters                     allocation counters
//! ```
//!
//! Ordering matters: prefix scans drive recognizer teardown and
//! durable-kind reconnection checks, so `get_after` must walk keys in
//! lexicographic byte order.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Bound;

use crate::slot::Vref;

/// Synchronous ordered key-value storage consumed by the vat.
///
/// All operations are infallible at this layer; the host is responsible
/// for surfacing storage faults before they reach the vat.
pub trait VatStore {
    /// Read a key, if present.
    fn get(&self, key: &str) -> Option<String>;

    /// Write a key.
    fn set(&self, key: &str, value: &str);

    /// Delete a key. Deleting an absent key is a no-op.
    fn delete(&self, key: &str);

    /// Return the first key/value pair with key strictly greater than
    /// `prior_key`, at or above `lower_bound`, and below `upper_bound`.
    ///
    /// When `upper_bound` is `None` the scan is confined to keys that
    /// start with `lower_bound` (prefix iteration). Passing an empty
    /// `prior_key` starts the scan at `lower_bound`.
    fn get_after(
        &self,
        prior_key: &str,
        lower_bound: &str,
        upper_bound: Option<&str>,
    ) -> Option<(String, String)>;
}

/// In-memory [`VatStore`] backed by an ordered map.
///
/// This is what every test in the crate runs against, and doubles as the
/// reference semantics for `get_after`. Handing two managers the same
/// `Rc<MemoryVatStore>` models a vat restart over surviving state.
#[derive(Debug, Default)]
pub struct MemoryVatStore {
    entries: RefCell<BTreeMap<String, String>>,
}

impl MemoryVatStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently stored.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// True when no rows are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Remove every row.
    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    /// Snapshot of all keys, in order. Test convenience.
    pub fn keys(&self) -> Vec<String> {
        self.entries.borrow().keys().cloned().collect()
    }
}

impl VatStore for MemoryVatStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
    }

    fn delete(&self, key: &str) {
        self.entries.borrow_mut().remove(key);
    }

    fn get_after(
        &self,
        prior_key: &str,
        lower_bound: &str,
        upper_bound: Option<&str>,
    ) -> Option<(String, String)> {
        let entries = self.entries.borrow();
        let start: Bound<&str> = if prior_key < lower_bound {
            Bound::Included(lower_bound)
        } else {
            Bound::Excluded(prior_key)
        };
        let (key, value) = entries.range::<str, _>((start, Bound::Unbounded)).next()?;
        match upper_bound {
            Some(upper) if key.as_str() >= upper => None,
            None if !key.starts_with(lower_bound) => None,
            _ => Some((key.clone(), value.clone())),
        }
    }
}

/// All keys in the store starting with `prefix`, in order.
///
/// Collected eagerly so callers may delete rows while walking the result.
pub fn keys_with_prefix(store: &dyn VatStore, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut prior = String::new();
    while let Some((key, _)) = store.get_after(&prior, prefix, None) {
        prior.clone_from(&key);
        keys.push(key);
    }
    keys
}

/// True when at least one key with the prefix exists.
pub fn prefixed_keys_exist(store: &dyn VatStore, prefix: &str) -> bool {
    store.get_after("", prefix, None).is_some()
}

/// Store-key constructors for the namespaces this subsystem owns.
pub(crate) mod keys {
    use super::Vref;

    /// Key of the kind-handle kind's ID row.
    pub const KIND_ID_ID: &str = "kindIDID";
    /// Key of the persisted allocation counters.
    pub const ID_COUNTERS: &str = "idCounters";
    /// Prefix under which durable kind rows live.
    pub const DKIND_PREFIX: &str = "vom.dkind.";

    pub fn state(base_ref: &Vref) -> String {
        format!("vom.{base_ref}")
    }

    pub fn ref_count(base_ref: &Vref) -> String {
        format!("vom.rc.{base_ref}")
    }

    pub fn export_status(base_ref: &Vref) -> String {
        format!("vom.es.{base_ref}")
    }

    pub fn recognizer(vref: &Vref, recognizer_id: &str) -> String {
        format!("vom.ir.{vref}|{recognizer_id}")
    }

    pub fn recognizer_prefix(vref: &Vref) -> String {
        format!("vom.ir.{vref}|")
    }

    pub fn vkind_descriptor(kind_id: u64) -> String {
        format!("vom.vkind.{kind_id}.descriptor")
    }

    pub fn dkind_descriptor(kind_id: u64) -> String {
        format!("vom.dkind.{kind_id}.descriptor")
    }

    pub fn dkind_next_id(kind_id: u64) -> String {
        format!("vom.dkind.{kind_id}.nextID")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete_round_trip() {
        let store = MemoryVatStore::new();
        assert!(store.is_empty());
        store.set("vom.o+v1/1", "{}");
        assert_eq!(store.get("vom.o+v1/1").as_deref(), Some("{}"));
        assert_eq!(store.len(), 1);
        store.delete("vom.o+v1/1");
        assert_eq!(store.get("vom.o+v1/1"), None);
        store.delete("vom.o+v1/1");
        assert!(store.is_empty());
    }

    #[test]
    fn get_after_walks_a_prefix_in_order() {
        let store = MemoryVatStore::new();
        store.set("vom.ir.o-3|c1", "1");
        store.set("vom.ir.o-3|c2", "1");
        store.set("vom.ir.o-30|c9", "1");
        store.set("vom.rc.o-3", "2");

        let (k1, _) = store.get_after("", "vom.ir.o-3|", None).unwrap();
        assert_eq!(k1, "vom.ir.o-3|c1");
        let (k2, _) = store.get_after(&k1, "vom.ir.o-3|", None).unwrap();
        assert_eq!(k2, "vom.ir.o-3|c2");
        assert_eq!(store.get_after(&k2, "vom.ir.o-3|", None), None);
    }

    #[test]
    fn get_after_honors_an_explicit_upper_bound() {
        let store = MemoryVatStore::new();
        store.set("a.1", "x");
        store.set("a.2", "y");
        store.set("b.1", "z");
        let (k, v) = store.get_after("", "a.", Some("a.2")).unwrap();
        assert_eq!((k.as_str(), v.as_str()), ("a.1", "x"));
        assert_eq!(store.get_after("a.1", "a.", Some("a.2")), None);
        // Widening the bound past the prefix exposes later rows.
        let (k, _) = store.get_after("a.2", "a.", Some("c")).unwrap();
        assert_eq!(k, "b.1");
    }

    #[test]
    fn prefix_helpers() {
        let store = MemoryVatStore::new();
        assert!(!prefixed_keys_exist(&store, "vom.dkind."));
        store.set("vom.dkind.7.descriptor", "{}");
        store.set("vom.dkind.7.nextID", "1");
        store.set("vom.dkind.9.descriptor", "{}");
        assert!(prefixed_keys_exist(&store, "vom.dkind."));
        assert_eq!(
            keys_with_prefix(&store, "vom.dkind."),
            vec![
                "vom.dkind.7.descriptor",
                "vom.dkind.7.nextID",
                "vom.dkind.9.descriptor",
            ]
        );
    }

    #[test]
    fn key_namespaces_compose() {
        let base = Vref::from("o+v10/5");
        assert_eq!(keys::state(&base), "vom.o+v10/5");
        assert_eq!(keys::ref_count(&base), "vom.rc.o+v10/5");
        assert_eq!(keys::export_status(&base), "vom.es.o+v10/5");
        assert_eq!(keys::recognizer(&base, "c3"), "vom.ir.o+v10/5|c3");
        assert_eq!(keys::dkind_descriptor(7), "vom.dkind.7.descriptor");
        assert_eq!(keys::dkind_next_id(7), "vom.dkind.7.nextID");
    }
}
