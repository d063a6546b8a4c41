//! Kinds: the classes of virtual and durable objects.
//!
//! A kind couples a tag, an init function producing the initial state
//! record, and behavior: one method table for ordinary kinds, or one per
//! facet for multi-faceted kinds. Defining a kind yields a [`Kind`]
//! factory; making an instance allocates the next instance number under
//! the kind's ID, serializes and stores the initial state, and hands
//! back a representative.
//!
//! Representatives are thin. They carry no state, only their base ref
//! and a grip on the kind runtime; state lives in the cache and is read
//! through a [`StateRef`] inside behavior methods. Reanimation (building
//! a representative for a stored instance in a later turn or a later
//! incarnation) is therefore cheap and runs no user code.
//!
//! Construction of cyclic structures uses [`Kind::begin`]: the instance
//! is fully created and registered, but the builder exposes its state
//! accessor so fields can be patched to point at the new object itself
//! (or at siblings) before the handle is released.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

use crate::cache::{RawState, StateCache};
use crate::codec::{CapData, Value, ValueCodec};
use crate::error::{KindError, StateError};
use crate::handle::{GcHooks, ObjHandle};
use crate::refs::ReferenceManager;
use crate::slot::{make_base_ref, Vref};
use crate::store::{keys, VatStore};
use crate::table::SlotTable;

/// A behavior method: takes the invocation context and arguments,
/// returns a result value.
pub type Method = Rc<dyn Fn(&InvokeCtx, &[Value]) -> Result<Value, StateError>>;

/// Produces the initial state record of a new instance from the maker's
/// arguments.
pub type InitFn = Rc<dyn Fn(&[Value]) -> BTreeMap<String, Value>>;

/// A named set of behavior methods.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: BTreeMap<String, Method>,
}

impl MethodTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method, builder-style.
    pub fn with(
        mut self,
        name: impl Into<String>,
        method: impl Fn(&InvokeCtx, &[Value]) -> Result<Value, StateError> + 'static,
    ) -> Self {
        self.methods.insert(name.into(), Rc::new(method));
        self
    }

    fn get(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }
}

// Manual impl: method tables hold behavior closures and cannot derive Debug.
impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The behavior shape of a kind.
pub enum BehaviorSpec {
    /// One method table for the whole object.
    Single(MethodTable),
    /// One method table per facet, keyed by facet name. Facet indices
    /// follow sorted facet names.
    Multi(BTreeMap<String, MethodTable>),
}

/// Check a behavior spec against the entry point it was passed to and
/// split it into the facet-name list and per-index method tables.
pub(crate) fn split_behavior(
    tag: &str,
    spec: BehaviorSpec,
    expect_multi: bool,
) -> Result<(Option<Vec<String>>, Vec<MethodTable>), KindError> {
    match (spec, expect_multi) {
        (BehaviorSpec::Single(table), false) => Ok((None, vec![table])),
        (BehaviorSpec::Multi(facets), true) => {
            if facets.len() < 2 {
                return Err(KindError::TooFewFacets {
                    tag: tag.to_string(),
                    count: facets.len(),
                });
            }
            for name in facets.keys() {
                if name.is_empty() || name.contains(':') || name.contains('/') {
                    return Err(KindError::InvalidFacetName {
                        tag: tag.to_string(),
                        name: name.clone(),
                    });
                }
            }
            let mut names = Vec::with_capacity(facets.len());
            let mut tables = Vec::with_capacity(facets.len());
            for (name, table) in facets {
                names.push(name);
                tables.push(table);
            }
            Ok((Some(names), tables))
        }
        _ => Err(KindError::BehaviorShape {
            tag: tag.to_string(),
        }),
    }
}

/// Everything a kind runtime needs a grip on, cloned per kind.
#[derive(Clone)]
pub(crate) struct KindWiring {
    pub(crate) store: Rc<dyn VatStore>,
    pub(crate) cache: Rc<StateCache>,
    pub(crate) refs: Rc<ReferenceManager>,
    pub(crate) table: Rc<SlotTable>,
    pub(crate) codec: ValueCodec,
    pub(crate) gc: GcHooks,
}

/// The live machinery of one defined kind.
pub(crate) struct KindRuntime {
    kind_id: u64,
    tag: String,
    durable: bool,
    facet_names: Option<Vec<String>>,
    /// Method tables by facet index; a single entry for unfaceted kinds.
    behavior: Vec<MethodTable>,
    init: InitFn,
    wiring: KindWiring,
    next_instance: Cell<u64>,
}

impl KindRuntime {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        kind_id: u64,
        tag: String,
        durable: bool,
        facet_names: Option<Vec<String>>,
        behavior: Vec<MethodTable>,
        init: InitFn,
        wiring: KindWiring,
        next_instance: u64,
    ) -> Rc<Self> {
        Rc::new(Self {
            kind_id,
            tag,
            durable,
            facet_names,
            behavior,
            init,
            wiring,
            next_instance: Cell::new(next_instance),
        })
    }

    pub(crate) fn tag(&self) -> &str {
        &self.tag
    }

    pub(crate) fn kind_id(&self) -> u64 {
        self.kind_id
    }

    pub(crate) fn is_durable(&self) -> bool {
        self.durable
    }

    pub(crate) fn facet_names(&self) -> Option<&[String]> {
        self.facet_names.as_deref()
    }

    fn allocate_instance(&self) -> u64 {
        let instance = self.next_instance.get();
        self.next_instance.set(instance + 1);
        if self.durable {
            self.wiring.store.set(
                &keys::dkind_next_id(self.kind_id),
                &(instance + 1).to_string(),
            );
        }
        instance
    }

    fn serialize_field(&self, field: &str, value: &Value) -> Result<CapData, StateError> {
        let data = self.wiring.codec.serialize(value)?;
        if self.durable {
            for (index, slot) in data.slots.iter().enumerate() {
                if !self.wiring.refs.is_durable(slot)? {
                    return Err(StateError::NotDurable {
                        field: field.to_string(),
                        index,
                        vref: slot.to_string(),
                    });
                }
            }
        }
        Ok(data)
    }

    /// Build and register the representative (or facet cohort) for an
    /// instance. Fails while another one is live.
    fn instantiate(self: &Rc<Self>, base_ref: &Vref) -> Result<ObjHandle, StateError> {
        let handle =
            ObjHandle::representative(Rc::clone(self), base_ref.clone(), self.wiring.gc.clone());
        self.wiring.table.register_value(base_ref, &handle.core)?;
        self.wiring.cache.mark_rep_live(base_ref)?;
        Ok(handle)
    }

    pub(crate) fn begin(self: &Rc<Self>, args: &[Value]) -> Result<InstanceBuilder, StateError> {
        let instance = self.allocate_instance();
        let base_ref = make_base_ref(self.kind_id, instance, self.durable);
        let fields = (self.init)(args);
        let mut record = RawState::new();
        for (field, value) in fields {
            let data = self.serialize_field(&field, &value)?;
            for slot in &data.slots {
                self.wiring.refs.add_reachable_vref(slot)?;
            }
            record.insert(field, data);
        }
        self.wiring.cache.insert_record(&base_ref, record)?;
        let handle = self.instantiate(&base_ref)?;
        debug!(kind = %self.tag, base_ref = %base_ref, "instance created");
        Ok(InstanceBuilder {
            state: StateRef {
                base_ref,
                runtime: Rc::clone(self),
            },
            handle,
        })
    }

    pub(crate) fn make(self: &Rc<Self>, args: &[Value]) -> Result<ObjHandle, StateError> {
        Ok(self.begin(args)?.finish())
    }

    /// Rebuild a representative for a stored instance. Runs no init and
    /// loads no state; both happen lazily on first access.
    pub(crate) fn reanimate(self: &Rc<Self>, base_ref: &Vref) -> Result<ObjHandle, StateError> {
        trace!(kind = %self.tag, base_ref = %base_ref, "reanimate");
        self.instantiate(base_ref)
    }

    /// Delete an instance's stored representation, releasing every slot
    /// its state referenced. `None` when nothing was stored.
    pub(crate) fn delete_stored(&self, base_ref: &Vref) -> Result<Option<bool>, StateError> {
        let Some(record) = self.wiring.cache.take_record(base_ref)? else {
            return Ok(None);
        };
        let mut do_more_gc = false;
        for data in record.values() {
            for slot in &data.slots {
                do_more_gc |= self.wiring.refs.remove_reachable_vref(slot)?;
            }
        }
        self.wiring.store.delete(&keys::state(base_ref));
        trace!(kind = %self.tag, base_ref = %base_ref, "stored state deleted");
        Ok(Some(do_more_gc))
    }

    fn state_ref(self: &Rc<Self>, handle: &ObjHandle) -> StateRef {
        let base_ref = handle
            .base_ref()
            .unwrap_or_else(|| panic!("representative without a base ref: {handle:?}"));
        StateRef {
            base_ref,
            runtime: Rc::clone(self),
        }
    }

    pub(crate) fn invoke(
        self: &Rc<Self>,
        handle: &ObjHandle,
        method: &str,
        args: &[Value],
    ) -> Result<Value, StateError> {
        if self.facet_names.is_some() && handle.facet.is_none() {
            return Err(StateError::NotInvokable(format!(
                "the facet cohort of kind `{}`",
                self.tag
            )));
        }
        let index = handle.facet.unwrap_or(0) as usize;
        let method_fn = self.behavior[index]
            .get(method)
            .ok_or_else(|| StateError::UnknownMethod {
                tag: self.tag.clone(),
                name: method.to_string(),
            })?
            .clone();
        let ctx = InvokeCtx {
            state: self.state_ref(handle),
            target: handle.clone(),
        };
        method_fn(&ctx, args)
    }

    fn facet_by_name(&self, handle: &ObjHandle, name: &str) -> Result<ObjHandle, StateError> {
        let names = self
            .facet_names
            .as_ref()
            .ok_or_else(|| StateError::WrongFacetiousness {
                tag: self.tag.clone(),
                expected: "multi-faceted",
            })?;
        let index = names
            .iter()
            .position(|candidate| candidate == name)
            .ok_or_else(|| StateError::UnknownFacetName {
                tag: self.tag.clone(),
                name: name.to_string(),
            })?;
        Ok(ObjHandle::from_parts(
            Rc::clone(&handle.core),
            Some(index as u32),
        ))
    }

    fn facets_of(&self, handle: &ObjHandle) -> Result<Vec<(String, ObjHandle)>, StateError> {
        let names = self
            .facet_names
            .as_ref()
            .ok_or_else(|| StateError::WrongFacetiousness {
                tag: self.tag.clone(),
                expected: "multi-faceted",
            })?;
        Ok(names
            .iter()
            .enumerate()
            .map(|(index, name)| {
                (
                    name.clone(),
                    ObjHandle::from_parts(Rc::clone(&handle.core), Some(index as u32)),
                )
            })
            .collect())
    }
}

/// A defined kind: the factory for its instances.
#[derive(Clone)]
pub struct Kind {
    runtime: Rc<KindRuntime>,
}

impl Kind {
    pub(crate) fn from_runtime(runtime: Rc<KindRuntime>) -> Self {
        Self { runtime }
    }

    /// The kind's tag.
    pub fn tag(&self) -> &str {
        self.runtime.tag()
    }

    /// Whether instances survive incarnations.
    pub fn is_durable(&self) -> bool {
        self.runtime.durable
    }

    /// Make a new instance. For multi-faceted kinds the returned handle
    /// is the cohort; pick facets with [`ObjHandle::facet`].
    pub fn make(&self, args: &[Value]) -> Result<ObjHandle, StateError> {
        self.runtime.make(args)
    }

    /// Make a new instance but keep its state patchable until
    /// [`InstanceBuilder::finish`], for building cyclic structures.
    pub fn begin(&self, args: &[Value]) -> Result<InstanceBuilder, StateError> {
        self.runtime.begin(args)
    }
}

// Manual impl: kind runtimes hold behavior closures and cannot derive Debug.
impl fmt::Debug for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kind")
            .field("tag", &self.runtime.tag)
            .field("durable", &self.runtime.durable)
            .finish()
    }
}

/// A made instance whose state is still being patched.
pub struct InstanceBuilder {
    state: StateRef,
    handle: ObjHandle,
}

impl InstanceBuilder {
    /// The new instance's handle (the cohort for multi-faceted kinds).
    pub fn handle(&self) -> ObjHandle {
        self.handle.clone()
    }

    /// The new instance's state accessor.
    pub fn state(&self) -> &StateRef {
        &self.state
    }

    /// Release the finished instance.
    pub fn finish(self) -> ObjHandle {
        self.handle
    }
}

/// Accessor for one instance's persisted state.
///
/// Reads load through the state cache; writes serialize, enforce
/// durability, adjust the reference counts of everything the old and new
/// values point at, and mark the record dirty. The field set is fixed by
/// the kind's init function.
#[derive(Clone)]
pub struct StateRef {
    base_ref: Vref,
    runtime: Rc<KindRuntime>,
}

impl StateRef {
    /// Read one field.
    pub fn get(&self, field: &str) -> Result<Value, StateError> {
        let data = self.runtime.wiring.cache.read_field(&self.base_ref, field)?;
        self.runtime.wiring.codec.unserialize(&data)
    }

    /// Read one field and decode its body.
    pub fn get_data<T: DeserializeOwned>(&self, field: &str) -> Result<T, StateError> {
        self.get(field)?.to_data()
    }

    /// Write one field.
    pub fn set(&self, field: &str, value: &Value) -> Result<(), StateError> {
        let data = self.runtime.serialize_field(field, value)?;
        let old = self.runtime.wiring.cache.read_field(&self.base_ref, field)?;
        self.runtime
            .wiring
            .refs
            .update_reference_counts(&old.slots, &data.slots)?;
        self.runtime
            .wiring
            .cache
            .replace_field(&self.base_ref, field, data)?;
        Ok(())
    }

    /// Write one field from anything serializable.
    pub fn set_data<T: Serialize>(&self, field: &str, value: &T) -> Result<(), StateError> {
        self.set(field, &Value::data_from(value)?)
    }
}

/// What a behavior method sees: the instance's state and itself.
pub struct InvokeCtx {
    state: StateRef,
    target: ObjHandle,
}

impl InvokeCtx {
    /// The invoked instance's state.
    pub fn state(&self) -> &StateRef {
        &self.state
    }

    /// The representative itself, for unfaceted kinds.
    pub fn self_handle(&self) -> Result<ObjHandle, StateError> {
        if self.target.core.facet_names().is_some() {
            return Err(StateError::WrongFacetiousness {
                tag: self.state.runtime.tag.clone(),
                expected: "single-faceted",
            });
        }
        Ok(self.target.clone())
    }

    /// A sibling facet of the invoked instance, by name.
    pub fn facet(&self, name: &str) -> Result<ObjHandle, StateError> {
        self.state.runtime.facet_by_name(&self.target, name)
    }

    /// All facets of the invoked instance, in facet order.
    pub fn facets(&self) -> Result<Vec<(String, ObjHandle)>, StateError> {
        self.state.runtime.facets_of(&self.target)
    }
}

impl ObjHandle {
    /// Invoke a behavior method on this representative or facet.
    pub fn invoke(&self, method: &str, args: &[Value]) -> Result<Value, StateError> {
        match self.runtime() {
            Some(runtime) => runtime.invoke(self, method, args),
            None => Err(StateError::NotInvokable(format!("{self:?}"))),
        }
    }

    /// One facet of this multi-faceted object, by name. Works from the
    /// cohort or from any sibling facet.
    pub fn facet(&self, name: &str) -> Result<ObjHandle, StateError> {
        match self.runtime() {
            Some(runtime) => runtime.facet_by_name(self, name),
            None => Err(StateError::NotInvokable(format!("{self:?}"))),
        }
    }

    /// All facets of this multi-faceted object, in facet order.
    pub fn facets(&self) -> Result<Vec<(String, ObjHandle)>, StateError> {
        match self.runtime() {
            Some(runtime) => runtime.facets_of(self),
            None => Err(StateError::NotInvokable(format!("{self:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_table() -> MethodTable {
        MethodTable::new().with("poke", |_ctx, _args| Ok(Value::data(serde_json::json!(null))))
    }

    #[test]
    fn single_behavior_splits_to_one_table() {
        let (names, tables) = split_behavior("thing", BehaviorSpec::Single(noop_table()), false).unwrap();
        assert_eq!(names, None);
        assert_eq!(tables.len(), 1);
    }

    #[test]
    fn multi_behavior_orders_facets_by_name() {
        let facets = BTreeMap::from([
            ("writer".to_string(), noop_table()),
            ("reader".to_string(), noop_table()),
            ("admin".to_string(), noop_table()),
        ]);
        let (names, tables) = split_behavior("gadget", BehaviorSpec::Multi(facets), true).unwrap();
        assert_eq!(
            names,
            Some(vec![
                "admin".to_string(),
                "reader".to_string(),
                "writer".to_string()
            ])
        );
        assert_eq!(tables.len(), 3);
    }

    #[test]
    fn behavior_shape_mismatches_are_rejected() {
        let err = split_behavior("thing", BehaviorSpec::Single(noop_table()), true).unwrap_err();
        assert!(matches!(err, KindError::BehaviorShape { .. }));

        let one = BTreeMap::from([("only".to_string(), noop_table())]);
        let err = split_behavior("thing", BehaviorSpec::Multi(one), true).unwrap_err();
        assert!(matches!(err, KindError::TooFewFacets { count: 1, .. }));

        let bad = BTreeMap::from([
            ("ok".to_string(), noop_table()),
            ("not:ok".to_string(), noop_table()),
        ]);
        let err = split_behavior("thing", BehaviorSpec::Multi(bad), true).unwrap_err();
        assert!(matches!(err, KindError::InvalidFacetName { name, .. } if name == "not:ok"));
    }
}
