//! Serialized values and the codec between handles and slots.
//!
//! A value crossing into the store (or to the kernel) becomes *capdata*:
//! an opaque JSON body plus the ordered list of vrefs it references.
//! Only the slot list matters to this subsystem; bodies are carried
//! untouched. The in-RAM mirror of capdata is [`Value`], which carries
//! live handles instead of vrefs.
//!
//! Serialization is where objects get their wire names: the first time a
//! remotable or a locally created promise is serialized it is assigned
//! the next export or promise ID and registered in the slot table.

use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::StateError;
use crate::handle::{ObjBody, ObjHandle};
use crate::refs::{IdKind, ReferenceManager};
use crate::slot::Vref;
use crate::table::SlotTable;

/// A serialized value: opaque body plus referenced slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapData {
    /// The encoded body. Its internal format is the embedder's business.
    pub body: serde_json::Value,
    /// Every vref the value references, in body order.
    pub slots: Vec<Vref>,
}

impl CapData {
    /// Assemble capdata from parts.
    pub fn new(body: impl Into<serde_json::Value>, slots: Vec<Vref>) -> Self {
        Self {
            body: body.into(),
            slots,
        }
    }
}

/// A value as userspace sees it: an opaque body plus live handles.
///
/// Equality compares bodies structurally and handles by identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    body: serde_json::Value,
    refs: Vec<ObjHandle>,
}

impl Value {
    /// A pure-data value with no object references.
    pub fn data(body: impl Into<serde_json::Value>) -> Self {
        Self {
            body: body.into(),
            refs: Vec::new(),
        }
    }

    /// A pure-data value encoded from anything serializable.
    pub fn data_from<T: Serialize>(value: &T) -> Result<Self, StateError> {
        Ok(Self {
            body: serde_json::to_value(value)?,
            refs: Vec::new(),
        })
    }

    /// A value that is just one object reference.
    pub fn handle(handle: ObjHandle) -> Self {
        Self {
            body: serde_json::Value::Null,
            refs: vec![handle],
        }
    }

    /// A value with both a body and object references.
    pub fn with_refs(body: impl Into<serde_json::Value>, refs: Vec<ObjHandle>) -> Self {
        Self {
            body: body.into(),
            refs,
        }
    }

    /// The opaque body.
    pub fn body(&self) -> &serde_json::Value {
        &self.body
    }

    /// The referenced handles, in body order.
    pub fn refs(&self) -> &[ObjHandle] {
        &self.refs
    }

    /// Decode the body.
    pub fn to_data<T: DeserializeOwned>(&self) -> Result<T, StateError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// The single referenced handle, when there is exactly one.
    pub fn to_handle(&self) -> Option<ObjHandle> {
        match self.refs.as_slice() {
            [handle] => Some(handle.clone()),
            _ => None,
        }
    }
}

/// Translates between [`Value`]s and [`CapData`].
#[derive(Clone)]
pub(crate) struct ValueCodec {
    table: Rc<SlotTable>,
    refs: Rc<ReferenceManager>,
}

impl ValueCodec {
    pub(crate) fn new(table: Rc<SlotTable>, refs: Rc<ReferenceManager>) -> Self {
        Self { table, refs }
    }

    /// The vref a handle serializes as, assigning one on first export of
    /// a remotable or local promise.
    pub(crate) fn slot_for_handle(&self, handle: &ObjHandle) -> Result<Vref, StateError> {
        if handle.is_cohort() {
            return Err(StateError::CohortNotSerializable);
        }
        if let Some(vref) = handle.vref() {
            return Ok(vref);
        }
        let vref = match &handle.core.body {
            ObjBody::Remotable { .. } => {
                Vref::new(format!("o+{}", self.refs.allocate_next_id(IdKind::Export)))
            }
            ObjBody::Promise => {
                Vref::new(format!("p+{}", self.refs.allocate_next_id(IdKind::Promise)))
            }
            // Presences, devices, and representatives carry a vref from
            // construction.
            _ => unreachable!("vref-less handle: {handle:?}"),
        };
        handle.assign_vref(vref.clone());
        self.table.register_value(&vref, &handle.core)?;
        trace!(vref = %vref, "first export");
        Ok(vref)
    }

    pub(crate) fn serialize(&self, value: &Value) -> Result<CapData, StateError> {
        let mut slots = Vec::with_capacity(value.refs.len());
        for handle in &value.refs {
            slots.push(self.slot_for_handle(handle)?);
        }
        Ok(CapData {
            body: value.body.clone(),
            slots,
        })
    }

    pub(crate) fn unserialize(&self, capdata: &CapData) -> Result<Value, StateError> {
        let mut refs = Vec::with_capacity(capdata.slots.len());
        for vref in &capdata.slots {
            refs.push(self.refs.required_val_for_slot(vref)?);
        }
        Ok(Value {
            body: capdata.body.clone(),
            refs,
        })
    }
}
