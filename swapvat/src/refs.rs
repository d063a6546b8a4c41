//! Virtual reference manager: the bookkeeping half of GC.
//!
//! Tracks, per vref, the persistent legs that can keep an object alive
//! after its last in-RAM handle is gone:
//!
//! - the persisted reference count (`vom.rc.` rows), one increment per
//!   appearance in virtualized data;
//! - the export status (`vom.es.` rows), one char per facet, recording
//!   whether the kernel side still reaches (`r`) or merely recognizes
//!   (`s`) each facet;
//! - recognizers: weak collections (RAM) and virtual collections
//!   (persisted `vom.ir.` markers) that could still match the vref.
//!
//! Plain remotables and promises get different treatment. The store
//! cannot reconstruct them, so their "refcount" is an entry in an
//! in-memory map that holds the object strongly; dropping the count to
//! zero releases the hold and lets ordinary drop tracking take over.
//!
//! Death and retirement decisions also live here. When every leg of a
//! virtual object is down, [`ReferenceManager::possible_virtual_object_death`]
//! tears down its rows and releases everything its state referenced,
//! reporting whether that may have killed further objects.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::codec::Value;
use crate::error::{KindError, StateError};
use crate::handle::{GcHooks, HandleKey, ObjHandle};
use crate::slot::{parse_vat_slot, SlotType, Vref};
use crate::store::{keys, keys_with_prefix, prefixed_keys_exist, VatStore};
use crate::table::SlotTable;

/// Rebuilds a representative (or cohort) from persisted state.
pub(crate) type Reanimator =
    Rc<dyn Fn(&ReferenceManager, &Vref) -> Result<ObjHandle, StateError>>;

/// Deletes an instance's stored representation. Returns `None` when
/// nothing was stored (the instance is already gone), otherwise whether
/// releasing its slots may have made further objects collectable.
pub(crate) type Deleter =
    Rc<dyn Fn(&ReferenceManager, &Vref) -> Result<Option<bool>, StateError>>;

/// Callback into the collection engine when a persisted recognizer
/// marker is torn down; returns whether it released anything.
pub(crate) type DeleteCollectionEntry = Rc<dyn Fn(&str, &Vref) -> bool>;

/// What the kernel-facing side holds of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExportStatus {
    /// The kernel can still send messages to it.
    Reachable,
    /// Dropped, but the kernel could still recognize it as a key.
    Recognizable,
    /// Fully forgotten.
    None,
}

/// What a death check did.
#[derive(Debug, Default)]
pub(crate) struct DeathOutcome {
    /// The stored representation was torn down.
    pub(crate) deleted: bool,
    /// Deletion released references that may let more objects die.
    pub(crate) do_more_gc: bool,
    /// Export facets the kernel should now be told to retire.
    pub(crate) retirees: Vec<Vref>,
}

/// A weak collection's interest in vrefs, identified by allocation.
#[derive(Clone)]
pub(crate) enum Recognizer {
    /// A weak map's virtual-key table: vref to retained value.
    Map(Rc<RefCell<BTreeMap<Vref, Value>>>),
    /// A weak set's virtual-key table.
    Set(Rc<RefCell<BTreeSet<Vref>>>),
}

impl Recognizer {
    fn ident(&self) -> usize {
        match self {
            Recognizer::Map(map) => Rc::as_ptr(map) as usize,
            Recognizer::Set(set) => Rc::as_ptr(set) as usize,
        }
    }
}

struct KindInfo {
    durable: bool,
    /// Outer `None` until the defining module reports the facet layout;
    /// then `Some(None)` for unfaceted kinds, `Some(Some(names))` for
    /// faceted ones. Write-once.
    facet_names: RefCell<Option<Option<Vec<String>>>>,
    reanimator: Reanimator,
    deleter: Deleter,
}

/// Which allocation counter an ID comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdKind {
    /// Plain exports, virtual kind IDs, durable kind IDs.
    Export,
    /// Virtual collection IDs.
    Collection,
    /// Locally created promises.
    Promise,
}

fn initial_export_id() -> u64 {
    1
}
fn initial_collection_id() -> u64 {
    1
}
fn initial_promise_id() -> u64 {
    5
}

/// Persisted allocation counters. A saved record may predate a counter;
/// missing fields fall back to their initial values on load. `exportID`
/// starts at 1 because `o+0` belongs to the root object.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdCounters {
    #[serde(rename = "exportID", default = "initial_export_id")]
    export_id: u64,
    #[serde(rename = "collectionID", default = "initial_collection_id")]
    collection_id: u64,
    #[serde(rename = "promiseID", default = "initial_promise_id")]
    promise_id: u64,
}

impl Default for IdCounters {
    fn default() -> Self {
        Self {
            export_id: initial_export_id(),
            collection_id: initial_collection_id(),
            promise_id: initial_promise_id(),
        }
    }
}

enum SlotStatus {
    Add,
    Drop,
    Keep,
}

pub(crate) struct ReferenceManager {
    store: Rc<dyn VatStore>,
    table: Rc<SlotTable>,
    gc: GcHooks,
    relax_durability: bool,
    kind_info: RefCell<HashMap<u64, KindInfo>>,
    /// Strong holds with counts for remotables and promises referenced
    /// from virtualized data.
    remotable_refs: RefCell<HashMap<HandleKey, (ObjHandle, u64)>>,
    /// RAM-side recognizer table: vref to interested weak collections.
    vref_recognizers: RefCell<HashMap<Vref, Vec<Recognizer>>>,
    delete_collection_entry: RefCell<Option<DeleteCollectionEntry>>,
    possibly_retired: Rc<RefCell<BTreeSet<Vref>>>,
    id_counters: RefCell<Option<IdCounters>>,
    id_counters_dirty: Cell<bool>,
}

impl ReferenceManager {
    pub(crate) fn new(
        store: Rc<dyn VatStore>,
        table: Rc<SlotTable>,
        gc: GcHooks,
        possibly_retired: Rc<RefCell<BTreeSet<Vref>>>,
        relax_durability: bool,
    ) -> Self {
        Self {
            store,
            table,
            gc,
            relax_durability,
            kind_info: RefCell::new(HashMap::new()),
            remotable_refs: RefCell::new(HashMap::new()),
            vref_recognizers: RefCell::new(HashMap::new()),
            delete_collection_entry: RefCell::new(None),
            possibly_retired,
            id_counters: RefCell::new(None),
            id_counters_dirty: Cell::new(false),
        }
    }

    pub(crate) fn gc_hooks(&self) -> GcHooks {
        self.gc.clone()
    }

    fn note_possibly_dead(&self, base_ref: &Vref) {
        trace!(base_ref = %base_ref, "possibly dead");
        self.gc.possibly_dead.borrow_mut().insert(base_ref.clone());
    }

    fn note_import_possibly_retired(&self, vref: &Vref) {
        if let Ok(slot) = parse_vat_slot(vref.as_str()) {
            if slot.slot_type == SlotType::Object && !slot.allocated_by_vat {
                trace!(vref = %vref, "possibly retired");
                self.possibly_retired.borrow_mut().insert(vref.clone());
            }
        }
    }

    // --- Persisted reference counts ---

    pub(crate) fn get_ref_count(&self, base_ref: &Vref) -> u64 {
        match self.store.get(&keys::ref_count(base_ref)) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                panic!("malformed refcount row for `{base_ref}`: {raw:?}")
            }),
            None => 0,
        }
    }

    pub(crate) fn set_ref_count(&self, base_ref: &Vref, count: u64) {
        assert!(
            !base_ref.as_str().contains(':'),
            "refcounts are keyed by baseRef, got `{base_ref}`"
        );
        trace!(base_ref = %base_ref, count, "refcount");
        if count == 0 {
            self.store.delete(&keys::ref_count(base_ref));
            self.note_possibly_dead(base_ref);
        } else {
            self.store.set(&keys::ref_count(base_ref), &count.to_string());
        }
    }

    pub(crate) fn inc_ref_count(&self, base_ref: &Vref) {
        self.set_ref_count(base_ref, self.get_ref_count(base_ref) + 1);
    }

    pub(crate) fn dec_ref_count(&self, base_ref: &Vref) {
        let count = self.get_ref_count(base_ref);
        assert!(count > 0, "refcount below zero for `{base_ref}`");
        self.set_ref_count(base_ref, count - 1);
    }

    // --- Export status ---

    /// Whether any facet is kernel-reachable, and if none is, the facet
    /// vrefs (or bare baseRef for unfaceted kinds) the kernel could
    /// still recognize.
    pub(crate) fn get_export_status(&self, base_ref: &Vref) -> (bool, Vec<Vref>) {
        let Some(flags) = self.store.get(&keys::export_status(base_ref)) else {
            return (false, Vec::new());
        };
        let reachable = flags.contains('r');
        let mut retirees = Vec::new();
        if !reachable {
            if flags == "s" {
                retirees.push(base_ref.clone());
            } else {
                for (index, flag) in flags.chars().enumerate() {
                    if flag == 's' {
                        retirees.push(base_ref.with_facet(index as u32));
                    }
                }
            }
        }
        (reachable, retirees)
    }

    /// Record what the kernel holds of one export (one facet of it, for
    /// faceted kinds). Dropping to `Recognizable` while nothing else
    /// references the object queues it for a death check.
    pub(crate) fn set_export_status(
        &self,
        vref: &Vref,
        status: ExportStatus,
    ) -> Result<(), StateError> {
        let slot = parse_vat_slot(vref.as_str())?;
        let index = slot.facet.unwrap_or(0) as usize;
        let count = self.facet_count(slot.id)?;
        let key = keys::export_status(&slot.base_ref);
        let mut flags: Vec<char> = self
            .store
            .get(&key)
            .map(|raw| raw.chars().collect())
            .unwrap_or_default();
        // Rows written by an older incarnation may be short.
        if flags.len() < count.max(index + 1) {
            flags.resize(count.max(index + 1), 'n');
        }
        trace!(vref = %vref, status = ?status, "export status");
        match status {
            ExportStatus::Reachable => {
                flags[index] = 'r';
                self.store.set(&key, &flags.iter().collect::<String>());
            }
            ExportStatus::Recognizable => {
                flags[index] = 's';
                self.store.set(&key, &flags.iter().collect::<String>());
                if self.get_ref_count(&slot.base_ref) == 0 && !flags.contains(&'r') {
                    self.note_possibly_dead(&slot.base_ref);
                }
            }
            ExportStatus::None => {
                flags[index] = 'n';
                if flags.iter().all(|&flag| flag == 'n') {
                    self.store.delete(&key);
                } else {
                    self.store.set(&key, &flags.iter().collect::<String>());
                }
            }
        }
        Ok(())
    }

    pub(crate) fn is_virtual_object_reachable(&self, base_ref: &Vref) -> bool {
        self.get_export_status(base_ref).0 || self.get_ref_count(base_ref) > 0
    }

    pub(crate) fn is_presence_reachable(&self, vref: &Vref) -> bool {
        self.get_ref_count(vref) > 0
    }

    // --- Reachability from virtualized data ---

    /// Count one appearance of `vref` in virtualized data. Virtual and
    /// durable objects and imports get a persisted increment; remotables
    /// and promises get a strong in-memory hold.
    pub(crate) fn add_reachable_vref(&self, vref: &Vref) -> Result<(), StateError> {
        let slot = parse_vat_slot(vref.as_str())?;
        match slot.slot_type {
            SlotType::Object => {
                if slot.allocated_by_vat && !slot.is_virtual_object() {
                    self.bump_in_memory(vref)?;
                } else {
                    self.inc_ref_count(&slot.base_ref);
                }
            }
            SlotType::Promise => self.bump_in_memory(vref)?,
            SlotType::Device => {
                trace!(vref = %vref, "device slot in virtualized data; not counted")
            }
        }
        Ok(())
    }

    /// Release one appearance of `vref`. Returns true when this was the
    /// last in-memory hold on a remotable or promise, meaning its drop
    /// may now be observable and collection should run again.
    pub(crate) fn remove_reachable_vref(&self, vref: &Vref) -> Result<bool, StateError> {
        let slot = parse_vat_slot(vref.as_str())?;
        match slot.slot_type {
            SlotType::Object => {
                if slot.allocated_by_vat && !slot.is_virtual_object() {
                    Ok(self.unbump_in_memory(vref))
                } else {
                    self.dec_ref_count(&slot.base_ref);
                    Ok(false)
                }
            }
            SlotType::Promise => Ok(self.unbump_in_memory(vref)),
            SlotType::Device => Ok(false),
        }
    }

    fn bump_in_memory(&self, vref: &Vref) -> Result<(), StateError> {
        let handle = self.required_val_for_slot(vref)?;
        let key = handle.key();
        let mut counts = self.remotable_refs.borrow_mut();
        counts.entry(key).or_insert_with(|| (handle, 0)).1 += 1;
        Ok(())
    }

    fn unbump_in_memory(&self, vref: &Vref) -> bool {
        let core = self
            .table
            .live_core(vref)
            .unwrap_or_else(|| panic!("no live object for counted slot `{vref}`"));
        let key = ObjHandle::from_parts(core, None).key();
        let mut counts = self.remotable_refs.borrow_mut();
        let entry = counts
            .get_mut(&key)
            .unwrap_or_else(|| panic!("no in-memory count for `{vref}`"));
        assert!(entry.1 > 0, "in-memory count below zero for `{vref}`");
        entry.1 -= 1;
        if entry.1 == 0 {
            counts.remove(&key);
            trace!(vref = %vref, "released in-memory hold");
            true
        } else {
            false
        }
    }

    /// Adjust refcounts after a state write, by set difference: slots in
    /// `before` only are released, slots in `after` only are counted,
    /// slots in both are untouched. Duplicates within either list are
    /// insignificant. Processing is in sorted vref order.
    pub(crate) fn update_reference_counts(
        &self,
        before: &[Vref],
        after: &[Vref],
    ) -> Result<(), StateError> {
        let mut status: BTreeMap<&Vref, SlotStatus> = BTreeMap::new();
        for vref in before {
            status.insert(vref, SlotStatus::Drop);
        }
        for vref in after {
            match status.get(vref) {
                Some(SlotStatus::Drop) => {
                    status.insert(vref, SlotStatus::Keep);
                }
                Some(_) => {}
                None => {
                    status.insert(vref, SlotStatus::Add);
                }
            }
        }
        for (vref, state) in status {
            match state {
                SlotStatus::Add => self.add_reachable_vref(vref)?,
                SlotStatus::Drop => {
                    self.remove_reachable_vref(vref)?;
                }
                SlotStatus::Keep => {}
            }
        }
        Ok(())
    }

    // --- Recognizers ---

    /// Register a weak collection's interest in a value, if the value is
    /// the sort recognized by vref (virtual, durable, or imported).
    /// Remotables never enter this table.
    pub(crate) fn add_recognizable_value(&self, value: &ObjHandle, recognizer: &Recognizer) {
        let Some(vref) = value.vref_key() else { return };
        let mut table = self.vref_recognizers.borrow_mut();
        let list = table.entry(vref).or_default();
        if !list.iter().any(|r| r.ident() == recognizer.ident()) {
            list.push(recognizer.clone());
        }
    }

    pub(crate) fn remove_recognizable_value(&self, value: &ObjHandle, recognizer: &Recognizer) {
        if let Some(vref) = value.vref_key() {
            self.remove_recognizable_vref(&vref, recognizer);
        }
    }

    /// Withdraw one weak collection's interest in a vref. Removing the
    /// last recognizer of an import means this vat may now be unable to
    /// recognize it, so the vref is queued for retirement checking.
    pub(crate) fn remove_recognizable_vref(&self, vref: &Vref, recognizer: &Recognizer) {
        let mut table = self.vref_recognizers.borrow_mut();
        let list = table
            .get_mut(vref)
            .unwrap_or_else(|| panic!("no recognizers for `{vref}`"));
        let pos = list
            .iter()
            .position(|r| r.ident() == recognizer.ident())
            .unwrap_or_else(|| panic!("recognizer not registered for `{vref}`"));
        list.remove(pos);
        if list.is_empty() {
            table.remove(vref);
            drop(table);
            self.note_import_possibly_retired(vref);
        }
    }

    /// Persist a virtual collection's interest in a vref. Unlike the RAM
    /// flavor this applies to any object-type vref, plain exports
    /// included.
    pub(crate) fn add_persisted_recognizer(&self, vref: &Vref, recognizer_id: &str) {
        if let Ok(slot) = parse_vat_slot(vref.as_str()) {
            if slot.slot_type == SlotType::Object {
                self.store.set(&keys::recognizer(vref, recognizer_id), "1");
            }
        }
    }

    pub(crate) fn remove_persisted_recognizer(&self, vref: &Vref, recognizer_id: &str) {
        self.store.delete(&keys::recognizer(vref, recognizer_id));
        self.note_import_possibly_retired(vref);
    }

    pub(crate) fn set_delete_collection_entry(&self, callback: DeleteCollectionEntry) {
        *self.delete_collection_entry.borrow_mut() = Some(callback);
    }

    pub(crate) fn is_vref_recognizable(&self, vref: &Vref) -> bool {
        self.vref_recognizers.borrow().contains_key(vref)
            || prefixed_keys_exist(self.store.as_ref(), &keys::recognizer_prefix(vref))
    }

    /// Make `vref` unrecognizable everywhere: weak collections forget
    /// their entries, persisted markers are deleted (notifying the
    /// collection engine). A faceted kind's bare baseRef expands to
    /// every facet. Returns whether anything was released that could
    /// make further objects collectable.
    pub(crate) fn cease_recognition(&self, vref: &Vref) -> Result<bool, StateError> {
        let mut do_more_gc = false;
        let slot = parse_vat_slot(vref.as_str())?;
        if slot.allocated_by_vat && slot.is_virtual_object() && slot.facet.is_none() {
            if let Some(names) = self.get_facet_names(slot.id) {
                for index in 0..names.len() {
                    do_more_gc |= self.cease_recognition(&vref.with_facet(index as u32))?;
                }
                return Ok(do_more_gc);
            }
        }
        let recognizers = self.vref_recognizers.borrow_mut().remove(vref);
        if let Some(recognizers) = recognizers {
            for recognizer in recognizers {
                match recognizer {
                    Recognizer::Map(map) => {
                        if map.borrow_mut().remove(vref).is_some() {
                            do_more_gc = true;
                        }
                    }
                    Recognizer::Set(set) => {
                        set.borrow_mut().remove(vref);
                    }
                }
            }
        }
        let callback = self.delete_collection_entry.borrow().clone();
        let prefix = keys::recognizer_prefix(vref);
        for key in keys_with_prefix(self.store.as_ref(), &prefix) {
            self.store.delete(&key);
            if let Some(callback) = &callback {
                let recognizer_id = &key[prefix.len()..];
                do_more_gc |= callback(recognizer_id, vref);
            }
        }
        Ok(do_more_gc)
    }

    // --- Kind registry ---

    pub(crate) fn register_kind(
        &self,
        kind_id: u64,
        reanimator: Reanimator,
        deleter: Deleter,
        durable: bool,
    ) {
        debug!(kind_id, durable, "kind registered");
        self.kind_info.borrow_mut().insert(
            kind_id,
            KindInfo {
                durable,
                facet_names: RefCell::new(None),
                reanimator,
                deleter,
            },
        );
    }

    /// Record a kind's facet layout: `None` for unfaceted kinds, the
    /// sorted facet names otherwise. Write-once per registration.
    pub(crate) fn remember_facet_names(&self, kind_id: u64, names: Option<Vec<String>>) {
        let kinds = self.kind_info.borrow();
        let info = kinds
            .get(&kind_id)
            .unwrap_or_else(|| panic!("facet names for unregistered kind {kind_id}"));
        let mut slot = info.facet_names.borrow_mut();
        assert!(
            slot.is_none(),
            "facet names already recorded for kind {kind_id}"
        );
        *slot = Some(names);
    }

    pub(crate) fn get_facet_names(&self, kind_id: u64) -> Option<Vec<String>> {
        self.kind_info
            .borrow()
            .get(&kind_id)?
            .facet_names
            .borrow()
            .clone()
            .flatten()
    }

    fn facet_count(&self, kind_id: u64) -> Result<usize, KindError> {
        let kinds = self.kind_info.borrow();
        let info = kinds.get(&kind_id).ok_or(KindError::Unknown(kind_id))?;
        let names = info.facet_names.borrow();
        Ok(match names.as_ref().and_then(|names| names.as_ref()) {
            Some(names) => names.len(),
            None => 1,
        })
    }

    pub(crate) fn is_durable_kind(&self, kind_id: u64) -> bool {
        self.kind_info
            .borrow()
            .get(&kind_id)
            .map(|info| info.durable)
            .unwrap_or(false)
    }

    /// Rebuild a representative for a stored instance whose kind must
    /// already be registered this incarnation.
    pub(crate) fn reanimate(&self, base_ref: &Vref) -> Result<ObjHandle, StateError> {
        let slot = parse_vat_slot(base_ref.as_str())?;
        let reanimator = {
            let kinds = self.kind_info.borrow();
            let info = kinds
                .get(&slot.id)
                .ok_or(KindError::Unknown(slot.id))?;
            Rc::clone(&info.reanimator)
        };
        trace!(base_ref = %base_ref, "reanimate");
        reanimator(self, base_ref)
    }

    fn delete_stored_representation(
        &self,
        base_ref: &Vref,
    ) -> Result<Option<bool>, StateError> {
        let slot = parse_vat_slot(base_ref.as_str())?;
        let deleter = {
            let kinds = self.kind_info.borrow();
            let info = kinds
                .get(&slot.id)
                .ok_or(KindError::Unknown(slot.id))?;
            Rc::clone(&info.deleter)
        };
        deleter(self, base_ref)
    }

    // --- Death ---

    /// Check whether a virtual object with no live representative is
    /// still held by anything persistent, and if not, delete it.
    ///
    /// A second check of an already-deleted baseRef is a no-op.
    pub(crate) fn possible_virtual_object_death(
        &self,
        base_ref: &Vref,
    ) -> Result<DeathOutcome, StateError> {
        let (reachable, retirees) = self.get_export_status(base_ref);
        if reachable || self.get_ref_count(base_ref) > 0 {
            return Ok(DeathOutcome::default());
        }
        let Some(mut do_more_gc) = self.delete_stored_representation(base_ref)? else {
            return Ok(DeathOutcome::default());
        };
        self.store.delete(&keys::ref_count(base_ref));
        self.store.delete(&keys::export_status(base_ref));
        do_more_gc |= self.cease_recognition(base_ref)?;
        debug!(base_ref = %base_ref, retirees = retirees.len(), "virtual object deleted");
        Ok(DeathOutcome {
            deleted: true,
            do_more_gc,
            retirees,
        })
    }

    // --- Durability ---

    /// Whether a value with this vref may be stored in durable state.
    pub(crate) fn is_durable(&self, vref: &Vref) -> Result<bool, StateError> {
        let slot = parse_vat_slot(vref.as_str())?;
        let durable = match slot.slot_type {
            SlotType::Promise => false,
            _ if self.relax_durability => true,
            SlotType::Device => false,
            SlotType::Object => {
                if !slot.allocated_by_vat {
                    true
                } else if slot.is_virtual_object() {
                    self.is_durable_kind(slot.id)
                } else {
                    false
                }
            }
        };
        Ok(durable)
    }

    // --- Slot resolution ---

    /// The live handle for a slot, reanimating virtual objects and
    /// minting presences, promises, and device nodes for imports on
    /// demand. Dead plain exports cannot be rebuilt and fail.
    pub(crate) fn required_val_for_slot(&self, vref: &Vref) -> Result<ObjHandle, StateError> {
        let slot = parse_vat_slot(vref.as_str())?;
        if let Some(handle) = self.table.lookup(&slot)? {
            return Ok(handle);
        }
        match slot.slot_type {
            SlotType::Object if slot.allocated_by_vat && slot.is_virtual_object() => {
                let whole = self.reanimate(&slot.base_ref)?;
                Ok(whole.facet_view(slot.facet)?)
            }
            SlotType::Object if !slot.allocated_by_vat => {
                let handle = ObjHandle::presence(vref.clone(), self.gc.clone());
                self.table.register_value(vref, &handle.core)?;
                Ok(handle)
            }
            SlotType::Promise if !slot.allocated_by_vat => {
                let handle = ObjHandle::promise(Some(vref.clone()), self.gc.clone());
                self.table.register_value(vref, &handle.core)?;
                Ok(handle)
            }
            SlotType::Device => {
                let handle = ObjHandle::device(vref.clone(), self.gc.clone());
                self.table.register_value(vref, &handle.core)?;
                Ok(handle)
            }
            _ => Err(StateError::UnknownSlot(vref.to_string())),
        }
    }

    // --- ID counters ---

    pub(crate) fn allocate_next_id(&self, kind: IdKind) -> u64 {
        let mut counters = self.id_counters.borrow_mut();
        let counters = counters.get_or_insert_with(|| match self.store.get(keys::ID_COUNTERS) {
            Some(raw) => serde_json::from_str(&raw)
                .unwrap_or_else(|err| panic!("malformed idCounters row: {err}")),
            None => IdCounters::default(),
        });
        let counter = match kind {
            IdKind::Export => &mut counters.export_id,
            IdKind::Collection => &mut counters.collection_id,
            IdKind::Promise => &mut counters.promise_id,
        };
        let id = *counter;
        *counter += 1;
        self.id_counters_dirty.set(true);
        id
    }

    pub(crate) fn flush_id_counters(&self) -> Result<(), StateError> {
        if !self.id_counters_dirty.get() {
            return Ok(());
        }
        if let Some(counters) = self.id_counters.borrow().as_ref() {
            self.store
                .set(keys::ID_COUNTERS, &serde_json::to_string(counters)?);
        }
        self.id_counters_dirty.set(false);
        Ok(())
    }

    // --- Introspection ---

    pub(crate) fn remotable_refs_len(&self) -> usize {
        self.remotable_refs.borrow().len()
    }

    pub(crate) fn recognizers_len(&self) -> usize {
        self.vref_recognizers.borrow().len()
    }

    pub(crate) fn kinds_len(&self) -> usize {
        self.kind_info.borrow().len()
    }

    #[cfg(test)]
    pub(crate) fn get_reachable_ref_count(&self, vref: &Vref) -> u64 {
        let slot = parse_vat_slot(vref.as_str()).expect("well-formed vref");
        let in_memory = match slot.slot_type {
            SlotType::Promise => true,
            SlotType::Object => slot.allocated_by_vat && !slot.is_virtual_object(),
            SlotType::Device => false,
        };
        if !in_memory {
            return self.get_ref_count(&slot.base_ref);
        }
        match self.table.live_core(vref) {
            Some(core) => {
                let key = ObjHandle::from_parts(core, None).key();
                self.remotable_refs
                    .borrow()
                    .get(&key)
                    .map(|(_, count)| *count)
                    .unwrap_or(0)
            }
            None => 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn get_reachable_promise_ref_count(&self, handle: &ObjHandle) -> u64 {
        self.remotable_refs
            .borrow()
            .get(&handle.key())
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }
}
