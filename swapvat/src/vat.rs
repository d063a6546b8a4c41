//! The vat facade: wiring, the kernel-facing surface, and the GC sweep.
//!
//! [`Vat::new`] assembles the subsystem over a [`VatStore`]: slot table,
//! state cache, reference manager, kind registry, codec. Everything
//! else on [`Vat`] is surface: factories for remotables and promises,
//! kind definition, serialization, the export/drop/retire deliveries the
//! kernel sends, and [`Vat::run_gc_sweep`].
//!
//! The sweep is the only place collection decisions become visible. It
//! drains the possibly-dead queue to fixpoint (deletions cascade by
//! refilling the queue), then the possibly-retired queue, and returns a
//! [`SweepReport`] naming what died. Turning the report into kernel
//! syscalls is the embedder's business; nothing here talks to a kernel
//! directly.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use tracing::debug;

use crate::cache::StateCache;
use crate::codec::{CapData, Value, ValueCodec};
use crate::config::VatConfig;
use crate::error::StateError;
use crate::handle::{GcHooks, ObjHandle};
use crate::kind::{BehaviorSpec, Kind, KindWiring};
use crate::objects::ObjectManager;
use crate::refs::{ExportStatus, IdKind, ReferenceManager};
use crate::slot::{parse_vat_slot, SlotType, Vref};
use crate::store::VatStore;
use crate::table::SlotTable;
use crate::weak::{VatWeakMap, VatWeakSet};

/// What a GC sweep decided.
///
/// The embedder forwards these to the kernel as its GC syscalls;
/// `deleted` is informational (those objects were only ever ours).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Virtual objects whose stored representation was torn down.
    pub deleted: BTreeSet<Vref>,
    /// Export vrefs the kernel should now retire.
    pub retire_exports: BTreeSet<Vref>,
    /// Import vrefs this vat no longer reaches.
    pub drop_imports: BTreeSet<Vref>,
    /// Import vrefs this vat can no longer even recognize.
    pub retire_imports: BTreeSet<Vref>,
}

impl SweepReport {
    /// True when the sweep found nothing to report.
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty()
            && self.retire_exports.is_empty()
            && self.drop_imports.is_empty()
            && self.retire_imports.is_empty()
    }
}

/// Sizes of the RAM-side retention tables, for leak hunting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionStats {
    /// Exported plain remotables held for the kernel.
    pub exported_remotables: usize,
    /// Exported remotables the kernel can still recognize.
    pub kernel_recognizable_remotables: usize,
    /// Remotables and promises pinned by virtualized data.
    pub remotable_refs: usize,
    /// Vrefs some weak collection recognizes.
    pub vref_recognizers: usize,
    /// Kinds with behavior attached this incarnation.
    pub defined_kinds: usize,
    /// Durable kind handles minted or reanimated this incarnation.
    pub kind_handles: usize,
    /// State records resident in the cache.
    pub resident_state_records: usize,
}

/// One vat's object-virtualization subsystem.
pub struct Vat {
    table: Rc<SlotTable>,
    cache: Rc<StateCache>,
    refs: Rc<ReferenceManager>,
    objects: Rc<ObjectManager>,
    codec: ValueCodec,
    /// Strong holds on exported plain remotables (the E leg for
    /// non-virtual exports).
    exported_remotables: RefCell<HashMap<Vref, ObjHandle>>,
    /// Exported remotables the kernel has not yet retired.
    kernel_recognizable: RefCell<BTreeSet<Vref>>,
    possibly_dead: Rc<RefCell<BTreeSet<Vref>>>,
    possibly_retired: Rc<RefCell<BTreeSet<Vref>>>,
}

impl Vat {
    /// Assemble the subsystem over `store`.
    pub fn new(store: Rc<dyn VatStore>, config: VatConfig) -> Self {
        let cache = Rc::new(StateCache::new(Rc::clone(&store), config.cache_size));
        let table = Rc::new(SlotTable::new());
        let possibly_dead = Rc::new(RefCell::new(BTreeSet::new()));
        let possibly_retired = Rc::new(RefCell::new(BTreeSet::new()));
        let gc = GcHooks {
            possibly_dead: Rc::clone(&possibly_dead),
            table: Rc::downgrade(&table),
            cache: Rc::downgrade(&cache),
        };
        let refs = Rc::new(ReferenceManager::new(
            Rc::clone(&store),
            Rc::clone(&table),
            gc.clone(),
            Rc::clone(&possibly_retired),
            config.relax_durability_rules,
        ));
        let codec = ValueCodec::new(Rc::clone(&table), Rc::clone(&refs));
        let objects = ObjectManager::new(KindWiring {
            store,
            cache: Rc::clone(&cache),
            refs: Rc::clone(&refs),
            table: Rc::clone(&table),
            codec: codec.clone(),
            gc,
        });
        debug!(
            cache_size = config.cache_size,
            relax_durability = config.relax_durability_rules,
            "vat subsystem assembled"
        );
        Self {
            table,
            cache,
            refs,
            objects,
            codec,
            exported_remotables: RefCell::new(HashMap::new()),
            kernel_recognizable: RefCell::new(BTreeSet::new()),
            possibly_dead,
            possibly_retired,
        }
    }

    // --- Factories ---

    /// A fresh plain remotable. It gets a vref on first export.
    pub fn make_remotable(&self, label: impl Into<String>) -> ObjHandle {
        ObjHandle::remotable(label, self.refs.gc_hooks())
    }

    /// A fresh local promise. It gets a vref on first export.
    pub fn make_promise(&self) -> ObjHandle {
        ObjHandle::promise(None, self.refs.gc_hooks())
    }

    /// The handle for an imported vref (`o-N`, `p-N`, `d-N`), minting a
    /// presence on first sight.
    pub fn import(&self, vref: &str) -> Result<ObjHandle, StateError> {
        let slot = parse_vat_slot(vref)?;
        if slot.allocated_by_vat {
            return Err(crate::error::SlotError::NotAnImport(vref.to_string()).into());
        }
        self.refs.required_val_for_slot(&Vref::from(vref))
    }

    /// Install `handle` as the root object, exported as `o+0`.
    pub fn register_root(&self, handle: &ObjHandle) -> Result<Vref, StateError> {
        assert!(
            handle.label().is_some(),
            "the root object must be a plain remotable"
        );
        let vref = Vref::from("o+0");
        handle.assign_vref(vref.clone());
        self.table.register_value(&vref, &handle.core)?;
        self.exported_remotables
            .borrow_mut()
            .insert(vref.clone(), handle.clone());
        self.kernel_recognizable.borrow_mut().insert(vref.clone());
        Ok(vref)
    }

    // --- Kinds ---

    /// Define a virtual kind.
    pub fn define_kind(
        &self,
        tag: &str,
        init: impl Fn(&[Value]) -> BTreeMap<String, Value> + 'static,
        behavior: BehaviorSpec,
    ) -> Result<Kind, StateError> {
        self.objects.define_kind(tag, Rc::new(init), behavior)
    }

    /// Define a multi-faceted virtual kind.
    pub fn define_kind_multi(
        &self,
        tag: &str,
        init: impl Fn(&[Value]) -> BTreeMap<String, Value> + 'static,
        behavior: BehaviorSpec,
    ) -> Result<Kind, StateError> {
        self.objects.define_kind_multi(tag, Rc::new(init), behavior)
    }

    /// Mint the durable handle that anchors a new durable kind.
    pub fn make_kind_handle(&self, tag: &str) -> Result<ObjHandle, StateError> {
        self.objects.make_kind_handle(tag)
    }

    /// Attach behavior to the durable kind anchored by `handle`.
    pub fn define_durable_kind(
        &self,
        handle: &ObjHandle,
        init: impl Fn(&[Value]) -> BTreeMap<String, Value> + 'static,
        behavior: BehaviorSpec,
    ) -> Result<Kind, StateError> {
        self.objects
            .define_durable_kind(handle, Rc::new(init), behavior)
    }

    /// Attach multi-faceted behavior to the durable kind anchored by
    /// `handle`.
    pub fn define_durable_kind_multi(
        &self,
        handle: &ObjHandle,
        init: impl Fn(&[Value]) -> BTreeMap<String, Value> + 'static,
        behavior: BehaviorSpec,
    ) -> Result<Kind, StateError> {
        self.objects
            .define_durable_kind_multi(handle, Rc::new(init), behavior)
    }

    /// Check that every durable kind from earlier incarnations got its
    /// behavior back. Call once startup has defined everything.
    pub fn insist_all_durable_kinds_reconnected(&self) -> Result<(), StateError> {
        self.objects.insist_all_durable_kinds_reconnected()
    }

    /// Whether `value` could be stored in durable state as-is.
    pub fn can_be_durable(&self, value: &Value) -> Result<bool, StateError> {
        self.objects.can_be_durable(value)
    }

    // --- Serialization ---

    /// Serialize a value, assigning export vrefs as needed.
    pub fn serialize(&self, value: &Value) -> Result<CapData, StateError> {
        self.codec.serialize(value)
    }

    /// Rebuild a value, reanimating virtual objects and minting
    /// presences on demand.
    pub fn unserialize(&self, data: &CapData) -> Result<Value, StateError> {
        self.codec.unserialize(data)
    }

    // --- Weak collections ---

    /// A weak map that does not retain its keys.
    pub fn make_weak_map(&self) -> VatWeakMap {
        VatWeakMap::new(Rc::clone(&self.refs))
    }

    /// A weak set that does not retain its members.
    pub fn make_weak_set(&self) -> VatWeakSet {
        VatWeakSet::new(Rc::clone(&self.refs))
    }

    // --- Collection-engine hooks ---

    /// Allocate a collection ID for an external collection engine.
    pub fn allocate_collection_id(&self) -> u64 {
        self.refs.allocate_next_id(IdKind::Collection)
    }

    /// Install the callback invoked when a persisted weak-collection
    /// entry must be deleted because its key was collected or retired.
    /// The callback returns whether it released anything.
    pub fn set_delete_collection_entry(
        &self,
        callback: impl Fn(&str, &Vref) -> bool + 'static,
    ) {
        self.refs.set_delete_collection_entry(Rc::new(callback));
    }

    /// Record that a persisted collection recognizes `vref` as a key.
    pub fn add_persisted_recognizer(&self, vref: &Vref, collection_id: &str) {
        self.refs.add_persisted_recognizer(vref, collection_id);
    }

    /// Withdraw a persisted collection's recognition of `vref`.
    pub fn remove_persisted_recognizer(&self, vref: &Vref, collection_id: &str) {
        self.refs.remove_persisted_recognizer(vref, collection_id);
    }

    /// Count one appearance of `vref` in externally-managed virtualized
    /// data.
    pub fn add_reachable_vref(&self, vref: &Vref) -> Result<(), StateError> {
        self.refs.add_reachable_vref(vref)
    }

    /// Release one appearance of `vref` from externally-managed
    /// virtualized data. Returns whether more GC work may now exist.
    pub fn remove_reachable_vref(&self, vref: &Vref) -> Result<bool, StateError> {
        self.refs.remove_reachable_vref(vref)
    }

    /// Adjust reference counts for a slot list replaced wholesale.
    pub fn update_reference_counts(
        &self,
        before: &[Vref],
        after: &[Vref],
    ) -> Result<(), StateError> {
        self.refs.update_reference_counts(before, after)
    }

    // --- Kernel-facing deliveries ---

    /// Export `handle`, returning the vref the kernel will know it by.
    pub fn export(&self, handle: &ObjHandle) -> Result<Vref, StateError> {
        let vref = self.codec.slot_for_handle(handle)?;
        let slot = parse_vat_slot(vref.as_str())?;
        if slot.slot_type == SlotType::Object && slot.allocated_by_vat {
            if slot.is_virtual_object() {
                self.refs.set_export_status(&vref, ExportStatus::Reachable)?;
            } else {
                self.exported_remotables
                    .borrow_mut()
                    .insert(vref.clone(), handle.clone());
                self.kernel_recognizable.borrow_mut().insert(vref.clone());
            }
        }
        Ok(vref)
    }

    /// The kernel dropped an export: unreachable from outside, but still
    /// recognizable as a weak key.
    pub fn drop_export(&self, vref: &str) -> Result<(), StateError> {
        let slot = parse_vat_slot(vref)?;
        assert!(
            slot.slot_type == SlotType::Object && slot.allocated_by_vat,
            "dropExport for non-export `{vref}`"
        );
        if slot.is_virtual_object() {
            self.refs
                .set_export_status(&Vref::from(vref), ExportStatus::Recognizable)?;
        } else {
            self.exported_remotables
                .borrow_mut()
                .remove(&Vref::from(vref));
        }
        Ok(())
    }

    /// The kernel retired an export: forgotten entirely.
    pub fn retire_export(&self, vref: &str) -> Result<(), StateError> {
        let slot = parse_vat_slot(vref)?;
        assert!(
            slot.slot_type == SlotType::Object && slot.allocated_by_vat,
            "retireExport for non-export `{vref}`"
        );
        if slot.is_virtual_object() {
            self.refs
                .set_export_status(&Vref::from(vref), ExportStatus::None)?;
        } else {
            let vref = Vref::from(vref);
            self.exported_remotables.borrow_mut().remove(&vref);
            self.kernel_recognizable.borrow_mut().remove(&vref);
        }
        Ok(())
    }

    /// The kernel retired an import: its upstream is gone for good, so
    /// nothing of ours may keep recognizing it.
    pub fn retire_import(&self, vref: &str) -> Result<(), StateError> {
        let slot = parse_vat_slot(vref)?;
        assert!(
            !slot.allocated_by_vat,
            "retireImport for non-import `{vref}`"
        );
        self.refs.cease_recognition(&Vref::from(vref))?;
        Ok(())
    }

    // --- End-of-delivery ---

    /// Write back everything held in RAM: dirty state records and the
    /// allocation counters.
    pub fn flush(&self) -> Result<(), StateError> {
        self.cache.flush()?;
        self.refs.flush_id_counters()
    }

    /// Drain the GC queues and report what died.
    ///
    /// Runs to fixpoint: deleting an object releases its state's
    /// references, which may enqueue further candidates. An entry whose
    /// object has a live handle again is skipped; being in the queue is
    /// a hint, never a verdict.
    pub fn run_gc_sweep(&self) -> Result<SweepReport, StateError> {
        self.cache.flush()?;
        let mut report = SweepReport::default();
        loop {
            let batch = std::mem::take(&mut *self.possibly_dead.borrow_mut());
            if batch.is_empty() {
                break;
            }
            for base_ref in batch {
                if self.table.has_live(&base_ref) {
                    continue;
                }
                let slot = parse_vat_slot(base_ref.as_str())?;
                if slot.slot_type != SlotType::Object {
                    continue;
                }
                if slot.allocated_by_vat {
                    if slot.is_virtual_object() {
                        let outcome = self.refs.possible_virtual_object_death(&base_ref)?;
                        if outcome.deleted {
                            report.deleted.insert(base_ref.clone());
                        }
                        report.retire_exports.extend(outcome.retirees);
                    } else if self.kernel_recognizable.borrow_mut().remove(&base_ref) {
                        // A dead plain export can never be re-exported;
                        // tell the kernel to forget it.
                        report.retire_exports.insert(base_ref.clone());
                    }
                } else if !self.refs.is_presence_reachable(&base_ref) {
                    report.drop_imports.insert(base_ref.clone());
                    if !self.refs.is_vref_recognizable(&base_ref) {
                        report.retire_imports.insert(base_ref.clone());
                    }
                }
            }
        }
        let retired = std::mem::take(&mut *self.possibly_retired.borrow_mut());
        for vref in retired {
            if !self.table.has_live(&vref)
                && !self.refs.is_presence_reachable(&vref)
                && !self.refs.is_vref_recognizable(&vref)
            {
                report.retire_imports.insert(vref);
            }
        }
        self.refs.flush_id_counters()?;
        debug!(
            deleted = report.deleted.len(),
            retire_exports = report.retire_exports.len(),
            drop_imports = report.drop_imports.len(),
            retire_imports = report.retire_imports.len(),
            "gc sweep finished"
        );
        Ok(report)
    }

    // --- Introspection ---

    /// Current sizes of the RAM-side retention tables.
    pub fn retention_stats(&self) -> RetentionStats {
        RetentionStats {
            exported_remotables: self.exported_remotables.borrow().len(),
            kernel_recognizable_remotables: self.kernel_recognizable.borrow().len(),
            remotable_refs: self.refs.remotable_refs_len(),
            vref_recognizers: self.refs.recognizers_len(),
            defined_kinds: self.objects.kind_count(),
            kind_handles: self.objects.kind_handle_count(),
            resident_state_records: self.cache.resident_len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryVatStore;
    use serde_json::json;

    fn fresh_vat() -> (Rc<MemoryVatStore>, Vat) {
        let store = Rc::new(MemoryVatStore::new());
        let vat = Vat::new(
            Rc::clone(&store) as Rc<dyn VatStore>,
            VatConfig::default(),
        );
        (store, vat)
    }

    #[test]
    fn exported_remotable_survives_local_drop_until_kernel_lets_go() {
        let (_store, vat) = fresh_vat();
        let obj = vat.make_remotable("thing");
        let vref = vat.export(&obj).unwrap();
        // o+1 went to the kind-handle kind ID on this fresh store.
        assert_eq!(vref.as_str(), "o+2");

        drop(obj);
        assert!(vat.table.has_live(&vref), "the export hold is strong");
        let report = vat.run_gc_sweep().unwrap();
        assert!(report.is_empty());

        vat.drop_export(vref.as_str()).unwrap();
        assert!(!vat.table.has_live(&vref));
        let report = vat.run_gc_sweep().unwrap();
        assert_eq!(report.retire_exports, BTreeSet::from([vref.clone()]));

        // The kernel already heard about it; a later sweep is silent.
        assert!(vat.run_gc_sweep().unwrap().is_empty());
    }

    #[test]
    fn import_drop_and_retire_are_reported_once_unreferenced() {
        let (_store, vat) = fresh_vat();
        let data = CapData::new(json!([null]), vec![Vref::from("o-3")]);
        let value = vat.unserialize(&data).unwrap();
        let presence = value.refs()[0].clone();
        drop(value);

        // Still recognized by a weak set: dropped but not retired.
        let seen = vat.make_weak_set();
        seen.add(&presence);
        drop(presence);
        let report = vat.run_gc_sweep().unwrap();
        assert_eq!(report.drop_imports, BTreeSet::from([Vref::from("o-3")]));
        assert!(report.retire_imports.is_empty());

        // Dropping the set releases recognition; now it retires.
        drop(seen);
        let report = vat.run_gc_sweep().unwrap();
        assert_eq!(report.retire_imports, BTreeSet::from([Vref::from("o-3")]));
    }

    #[test]
    fn import_referenced_from_virtual_state_is_not_dropped() {
        let (_store, vat) = fresh_vat();
        let kind = vat
            .define_kind(
                "holder",
                |args| BTreeMap::from([("held".to_string(), args[0].clone())]),
                BehaviorSpec::Single(crate::kind::MethodTable::new()),
            )
            .unwrap();
        let held = vat.import("o-5").unwrap();
        let holder = kind.make(&[Value::handle(held.clone())]).unwrap();

        drop(held);
        let report = vat.run_gc_sweep().unwrap();
        assert!(
            report.drop_imports.is_empty(),
            "virtual state still references the import"
        );

        // The holder is unreferenced, so it dies and releases the import.
        drop(holder);
        let report = vat.run_gc_sweep().unwrap();
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(report.drop_imports, BTreeSet::from([Vref::from("o-5")]));
        assert_eq!(report.retire_imports, BTreeSet::from([Vref::from("o-5")]));
    }

    #[test]
    fn root_registration_claims_o0() {
        let (_store, vat) = fresh_vat();
        let root = vat.make_remotable("root");
        assert_eq!(vat.register_root(&root).unwrap(), Vref::from("o+0"));
        // Serializing the root reuses the assigned vref.
        let data = vat.serialize(&Value::handle(root)).unwrap();
        assert_eq!(data.slots, vec![Vref::from("o+0")]);
    }

    #[test]
    fn sweep_flushes_dirty_state_before_deciding() {
        let (store, vat) = fresh_vat();
        let kind = vat
            .define_kind(
                "note",
                |_args| {
                    BTreeMap::from([(
                        "text".to_string(),
                        Value::data(json!("resident only")),
                    )])
                },
                BehaviorSpec::Single(crate::kind::MethodTable::new()),
            )
            .unwrap();
        let note = kind.make(&[]).unwrap();
        let base_ref = note.vref().unwrap();
        let state_key = crate::store::keys::state(&base_ref);
        assert_eq!(store.get(&state_key), None, "record still cache-resident");

        // Keep it alive through a refcount so the sweep's flush is
        // observable in the store.
        vat.add_reachable_vref(&base_ref).unwrap();
        drop(note);
        let report = vat.run_gc_sweep().unwrap();
        assert!(report.deleted.is_empty());
        assert!(store.get(&state_key).is_some(), "flush wrote the record");

        vat.remove_reachable_vref(&base_ref).unwrap();
        let report = vat.run_gc_sweep().unwrap();
        assert_eq!(report.deleted, BTreeSet::from([base_ref.clone()]));
        assert_eq!(store.get(&state_key), None);
    }
}
