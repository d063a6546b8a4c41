//! Kind definition entry points and the durable kind registry.
//!
//! Virtual kinds get a fresh kind ID each incarnation and exist only as
//! long as the vat does. Durable kinds are anchored by a kind handle: a
//! small durable object minted by [`ObjectManager::make_kind_handle`],
//! storable anywhere durable state reaches, whose instance number under
//! the reserved kind-handle kind is the durable kind's own ID. Each
//! incarnation must reconnect behavior to every durable kind before its
//! instances can be deserialized; [`insist_all_durable_kinds_reconnected`]
//! is the end-of-startup check that none were forgotten.
//!
//! The reserved kind-handle kind's ID lives in the `kindIDID` row, and
//! every durable kind keeps a descriptor row recording its tag and facet
//! shape so redefinition can be checked against what earlier
//! incarnations stored.
//!
//! [`insist_all_durable_kinds_reconnected`]:
//! ObjectManager::insist_all_durable_kinds_reconnected

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::Value;
use crate::error::{KindError, StateError};
use crate::handle::{GcHooks, HandleKey, ObjHandle};
use crate::kind::{split_behavior, BehaviorSpec, InitFn, Kind, KindRuntime, KindWiring};
use crate::refs::{Deleter, IdKind, Reanimator};
use crate::slot::{make_base_ref, parse_vat_slot, Vref};
use crate::store::{keys, keys_with_prefix};
use crate::table::SlotTable;

/// Persisted record of a kind: its ID, tag, and (for durable kinds,
/// once defined) its facet shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KindDescriptor {
    #[serde(rename = "kindID")]
    kind_id: u64,
    tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    facets: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unfaceted: Option<bool>,
}

/// Build the remotable that stands for a durable kind, under its stable
/// durable vref, and record it so definition calls can find the kind ID.
fn mint_kind_handle(
    descriptor: &KindDescriptor,
    base_ref: &Vref,
    gc: GcHooks,
    table: &SlotTable,
    kind_handles: &RefCell<HashMap<HandleKey, u64>>,
    holds: &RefCell<Vec<ObjHandle>>,
) -> Result<ObjHandle, StateError> {
    let handle = ObjHandle::remotable(format!("kind:{}", descriptor.tag), gc);
    handle.assign_vref(base_ref.clone());
    table.register_value(base_ref, &handle.core)?;
    kind_handles
        .borrow_mut()
        .insert(handle.key(), descriptor.kind_id);
    holds.borrow_mut().push(handle.clone());
    Ok(handle)
}

/// Registry of defined kinds and minted kind handles.
pub(crate) struct ObjectManager {
    wiring: KindWiring,
    /// Live runtimes by kind ID. These anchor the weak grips the
    /// reference manager's reanimators hold.
    kinds: RefCell<HashMap<u64, Rc<KindRuntime>>>,
    /// Durable kind IDs already given behavior this incarnation.
    defined_durable: RefCell<BTreeSet<u64>>,
    /// Kind handle identity to kind ID.
    kind_handles: Rc<RefCell<HashMap<HandleKey, u64>>>,
    /// Kind handles stay live for the whole incarnation.
    handle_holds: Rc<RefCell<Vec<ObjHandle>>>,
    /// The kind ID reserved for kind handles themselves.
    kind_handle_kind_id: u64,
}

impl ObjectManager {
    pub(crate) fn new(wiring: KindWiring) -> Rc<Self> {
        let kind_handle_kind_id = match wiring.store.get(keys::KIND_ID_ID) {
            Some(raw) => raw
                .parse()
                .unwrap_or_else(|_| panic!("malformed kindIDID row: {raw:?}")),
            None => {
                let id = wiring.refs.allocate_next_id(IdKind::Export);
                wiring.store.set(keys::KIND_ID_ID, &id.to_string());
                id
            }
        };
        let manager = Rc::new(Self {
            wiring,
            kinds: RefCell::new(HashMap::new()),
            defined_durable: RefCell::new(BTreeSet::new()),
            kind_handles: Rc::new(RefCell::new(HashMap::new())),
            handle_holds: Rc::new(RefCell::new(Vec::new())),
            kind_handle_kind_id,
        });
        manager.register_kind_handle_kind();
        manager
    }

    /// Register the reserved kind whose instances are kind handles. Its
    /// reanimator rebuilds handles from descriptor rows; its deleter is
    /// inert so a dropped handle never erases the kind it anchors.
    fn register_kind_handle_kind(&self) {
        let store = Rc::clone(&self.wiring.store);
        let table = Rc::clone(&self.wiring.table);
        let gc = self.wiring.gc.clone();
        let kind_handles = Rc::clone(&self.kind_handles);
        let holds = Rc::clone(&self.handle_holds);
        let reanimator: Reanimator = Rc::new(move |_refs, base_ref| {
            let slot = parse_vat_slot(base_ref.as_str())?;
            let kind_id = slot
                .subid
                .unwrap_or_else(|| panic!("kind handle without an instance number: {base_ref}"));
            let raw = store
                .get(&keys::dkind_descriptor(kind_id))
                .ok_or(KindError::UnknownDescriptor(kind_id))?;
            let descriptor: KindDescriptor = serde_json::from_str(&raw)?;
            mint_kind_handle(&descriptor, base_ref, gc.clone(), &table, &kind_handles, &holds)
        });
        let deleter: Deleter = Rc::new(|_refs, _base_ref| Ok(None));
        self.wiring
            .refs
            .register_kind(self.kind_handle_kind_id, reanimator, deleter, true);
        self.wiring
            .refs
            .remember_facet_names(self.kind_handle_kind_id, None);
    }

    fn save_descriptor(&self, descriptor: &KindDescriptor) -> Result<(), StateError> {
        self.wiring.store.set(
            &keys::dkind_descriptor(descriptor.kind_id),
            &serde_json::to_string(descriptor)?,
        );
        Ok(())
    }

    /// Wire a runtime into the reference manager and the kind table.
    /// The reference manager gets only weak grips, so dropping the
    /// manager (and with it the runtimes) tears the graph down cleanly.
    fn install(&self, runtime: Rc<KindRuntime>, facet_names: Option<Vec<String>>) -> Kind {
        let kind_id = runtime.kind_id();
        let durable = runtime.is_durable();
        let weak = Rc::downgrade(&runtime);
        let reanimator: Reanimator = Rc::new(move |_refs, base_ref| {
            let runtime = weak
                .upgrade()
                .unwrap_or_else(|| panic!("kind runtime gone for `{base_ref}`"));
            runtime.reanimate(base_ref)
        });
        let weak = Rc::downgrade(&runtime);
        let deleter: Deleter = Rc::new(move |_refs, base_ref| {
            let runtime = weak
                .upgrade()
                .unwrap_or_else(|| panic!("kind runtime gone for `{base_ref}`"));
            runtime.delete_stored(base_ref)
        });
        self.wiring
            .refs
            .register_kind(kind_id, reanimator, deleter, durable);
        self.wiring.refs.remember_facet_names(kind_id, facet_names);
        self.kinds.borrow_mut().insert(kind_id, Rc::clone(&runtime));
        debug!(kind_id, tag = runtime.tag(), durable, "kind defined");
        Kind::from_runtime(runtime)
    }

    fn define_virtual(
        &self,
        tag: &str,
        init: InitFn,
        behavior: BehaviorSpec,
        multi: bool,
    ) -> Result<Kind, StateError> {
        let (facet_names, tables) = split_behavior(tag, behavior, multi)?;
        let kind_id = self.wiring.refs.allocate_next_id(IdKind::Export);
        // Diagnostic row only; virtual kinds need no reconnection.
        self.wiring.store.set(
            &keys::vkind_descriptor(kind_id),
            &serde_json::to_string(&KindDescriptor {
                kind_id,
                tag: tag.to_string(),
                facets: None,
                unfaceted: None,
            })?,
        );
        let runtime = KindRuntime::new(
            kind_id,
            tag.to_string(),
            false,
            facet_names.clone(),
            tables,
            init,
            self.wiring.clone(),
            1,
        );
        Ok(self.install(runtime, facet_names))
    }

    pub(crate) fn define_kind(
        &self,
        tag: &str,
        init: InitFn,
        behavior: BehaviorSpec,
    ) -> Result<Kind, StateError> {
        self.define_virtual(tag, init, behavior, false)
    }

    pub(crate) fn define_kind_multi(
        &self,
        tag: &str,
        init: InitFn,
        behavior: BehaviorSpec,
    ) -> Result<Kind, StateError> {
        self.define_virtual(tag, init, behavior, true)
    }

    /// Mint the handle that anchors a new durable kind.
    pub(crate) fn make_kind_handle(&self, tag: &str) -> Result<ObjHandle, StateError> {
        let kind_id = self.wiring.refs.allocate_next_id(IdKind::Export);
        let descriptor = KindDescriptor {
            kind_id,
            tag: tag.to_string(),
            facets: None,
            unfaceted: None,
        };
        self.save_descriptor(&descriptor)?;
        self.wiring.store.set(&keys::dkind_next_id(kind_id), "1");
        let base_ref = make_base_ref(self.kind_handle_kind_id, kind_id, true);
        let handle = mint_kind_handle(
            &descriptor,
            &base_ref,
            self.wiring.gc.clone(),
            &self.wiring.table,
            &self.kind_handles,
            &self.handle_holds,
        )?;
        debug!(kind_id, tag, "kind handle made");
        Ok(handle)
    }

    fn check_facetiousness(
        descriptor: &KindDescriptor,
        new_facets: Option<&[String]>,
    ) -> Result<(), KindError> {
        match (
            descriptor.unfaceted,
            descriptor.facets.as_deref(),
            new_facets,
        ) {
            // Never defined before.
            (None, None, _) => Ok(()),
            (Some(true), _, None) => Ok(()),
            (_, Some(old), Some(new)) if old == new => Ok(()),
            _ => Err(KindError::FacetMismatch {
                tag: descriptor.tag.clone(),
            }),
        }
    }

    fn define_durable(
        &self,
        handle: &ObjHandle,
        init: InitFn,
        behavior: BehaviorSpec,
        multi: bool,
    ) -> Result<Kind, StateError> {
        let kind_id = *self
            .kind_handles
            .borrow()
            .get(&handle.key())
            .ok_or(KindError::UnknownHandle)?;
        let raw = self
            .wiring
            .store
            .get(&keys::dkind_descriptor(kind_id))
            .ok_or(KindError::UnknownDescriptor(kind_id))?;
        let mut descriptor: KindDescriptor = serde_json::from_str(&raw)?;
        if self.defined_durable.borrow().contains(&kind_id) {
            return Err(KindError::Redefined {
                tag: descriptor.tag,
            }
            .into());
        }
        let (facet_names, tables) = split_behavior(&descriptor.tag, behavior, multi)?;
        Self::check_facetiousness(&descriptor, facet_names.as_deref())?;
        self.defined_durable.borrow_mut().insert(kind_id);
        descriptor.facets = facet_names.clone();
        descriptor.unfaceted = facet_names.is_none().then_some(true);
        self.save_descriptor(&descriptor)?;
        let next_instance = match self.wiring.store.get(&keys::dkind_next_id(kind_id)) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                panic!("malformed instance counter for kind {kind_id}: {raw:?}")
            }),
            None => 1,
        };
        let runtime = KindRuntime::new(
            kind_id,
            descriptor.tag.clone(),
            true,
            facet_names.clone(),
            tables,
            init,
            self.wiring.clone(),
            next_instance,
        );
        Ok(self.install(runtime, facet_names))
    }

    pub(crate) fn define_durable_kind(
        &self,
        handle: &ObjHandle,
        init: InitFn,
        behavior: BehaviorSpec,
    ) -> Result<Kind, StateError> {
        self.define_durable(handle, init, behavior, false)
    }

    pub(crate) fn define_durable_kind_multi(
        &self,
        handle: &ObjHandle,
        init: InitFn,
        behavior: BehaviorSpec,
    ) -> Result<Kind, StateError> {
        self.define_durable(handle, init, behavior, true)
    }

    /// Check that behavior was reconnected to every durable kind earlier
    /// incarnations created. Called once startup is done defining kinds;
    /// instances of a forgotten kind would be undeserializable.
    pub(crate) fn insist_all_durable_kinds_reconnected(&self) -> Result<(), StateError> {
        let defined = self.defined_durable.borrow();
        let mut missing = Vec::new();
        for key in keys_with_prefix(self.wiring.store.as_ref(), keys::DKIND_PREFIX) {
            if !key.ends_with(".descriptor") {
                continue;
            }
            let raw = self
                .wiring
                .store
                .get(&key)
                .unwrap_or_else(|| panic!("descriptor row vanished: {key}"));
            let descriptor: KindDescriptor = serde_json::from_str(&raw)?;
            if !defined.contains(&descriptor.kind_id) {
                missing.push(descriptor.tag);
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(KindError::Unreconnected {
                tags: missing.join(", "),
            }
            .into())
        }
    }

    /// Whether a value could be stored in durable state as-is.
    pub(crate) fn can_be_durable(&self, value: &Value) -> Result<bool, StateError> {
        let data = self.wiring.codec.serialize(value)?;
        for slot in &data.slots {
            if !self.wiring.refs.is_durable(slot)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub(crate) fn kind_count(&self) -> usize {
        self.kinds.borrow().len()
    }

    pub(crate) fn kind_handle_count(&self) -> usize {
        self.kind_handles.borrow().len()
    }
}
