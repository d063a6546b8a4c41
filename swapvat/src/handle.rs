//! In-RAM object identity.
//!
//! Every object the vat can pass by reference is represented by an
//! [`ObjHandle`]: a cheaply-cloneable view onto a shared core. Two
//! handles are the same object exactly when they share a core (and, for
//! faceted objects, name the same facet). The core's lifetime is the
//! "L" retention leg: as long as any handle clone is live the object
//! cannot be collected, and the moment the last clone drops the core's
//! destructor enqueues the object for the next GC sweep.
//!
//! Cores are deliberately small. A representative core does not carry
//! its state record (that lives in the state cache, keyed by base ref),
//! only a grip on its kind runtime so behavior can be invoked and facet
//! shapes resolved. A faceted kind shares one core across the whole
//! cohort; individual facets are `(core, index)` views, which makes
//! cross-facet identity and cohort retention fall out of `Rc` counting
//! rather than bookkeeping.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::cache::StateCache;
use crate::error::SlotError;
use crate::kind::KindRuntime;
use crate::slot::{parse_vat_slot, SlotType, Vref};
use crate::table::SlotTable;

/// What a core actually is.
pub(crate) enum ObjBody {
    /// A plain vat-defined object, exported (if ever) as `o+N`.
    Remotable {
        /// Diagnostic label, carried through `Debug` output.
        label: String,
    },
    /// An imported object, `o-N`.
    Presence,
    /// A promise, either local (`p+N` once exported) or imported (`p-N`).
    Promise,
    /// An imported device node, `d-N` or `d+N`.
    Device,
    /// A virtual or durable object instance (or cohort of facets).
    Representative { runtime: Rc<KindRuntime> },
}

impl ObjBody {
    fn kind_name(&self) -> &'static str {
        match self {
            ObjBody::Remotable { .. } => "remotable",
            ObjBody::Presence => "presence",
            ObjBody::Promise => "promise",
            ObjBody::Device => "device",
            ObjBody::Representative { .. } => "representative",
        }
    }
}

/// Callbacks a dying core uses to notify the rest of the vat.
///
/// The table and cache are held weakly so that handles which outlive
/// the vat itself degrade to inert tokens instead of keeping the
/// bookkeeping alive.
#[derive(Clone)]
pub(crate) struct GcHooks {
    pub(crate) possibly_dead: Rc<RefCell<BTreeSet<Vref>>>,
    pub(crate) table: Weak<SlotTable>,
    pub(crate) cache: Weak<StateCache>,
}

impl GcHooks {
    /// Hooks wired to nothing. Drops become pure queue inserts.
    #[cfg(test)]
    pub(crate) fn disconnected() -> Self {
        Self {
            possibly_dead: Rc::new(RefCell::new(BTreeSet::new())),
            table: Weak::new(),
            cache: Weak::new(),
        }
    }
}

/// Shared interior of an [`ObjHandle`].
pub(crate) struct ObjCore {
    /// The object's vref (base ref for representatives). Remotables and
    /// local promises start with `None` and are assigned on first
    /// serialization.
    pub(crate) vref: RefCell<Option<Vref>>,
    pub(crate) body: ObjBody,
    gc: GcHooks,
}

impl ObjCore {
    /// Facet names when this core is a faceted representative.
    pub(crate) fn facet_names(&self) -> Option<&[String]> {
        match &self.body {
            ObjBody::Representative { runtime } => runtime.facet_names(),
            _ => None,
        }
    }
}

impl Drop for ObjCore {
    fn drop(&mut self) {
        let Some(vref) = self.vref.borrow().clone() else {
            return;
        };
        let ptr = self as *const ObjCore as usize;
        if let Some(table) = self.gc.table.upgrade() {
            table.remove_if(&vref, ptr);
        }
        match &self.body {
            ObjBody::Representative { .. } => {
                if let Some(cache) = self.gc.cache.upgrade() {
                    cache.mark_rep_dropped(&vref);
                }
                self.gc.possibly_dead.borrow_mut().insert(vref);
            }
            ObjBody::Presence | ObjBody::Remotable { .. } => {
                self.gc.possibly_dead.borrow_mut().insert(vref);
            }
            // Promise lifecycle and device release are kernel protocol,
            // not sweep input; dropping them only clears the table row.
            ObjBody::Promise | ObjBody::Device => {}
        }
    }
}

/// Identity key for RAM-side maps that must not retain their keys.
///
/// Built from the core's address plus the facet index, so it is only
/// meaningful while something else proves the core is (or was) live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct HandleKey(usize, Option<u32>);

/// A reference to an object the vat knows by identity.
///
/// Clones are cheap and all refer to the same underlying object;
/// equality is identity, never structure. Handles for virtual and
/// durable objects ("representatives") additionally give access to the
/// object's behavior via [`ObjHandle::invoke`].
#[derive(Clone)]
pub struct ObjHandle {
    pub(crate) core: Rc<ObjCore>,
    pub(crate) facet: Option<u32>,
}

impl ObjHandle {
    fn from_body(body: ObjBody, vref: Option<Vref>, gc: GcHooks) -> Self {
        let core = Rc::new(ObjCore {
            vref: RefCell::new(vref),
            body,
            gc,
        });
        Self { core, facet: None }
    }

    pub(crate) fn remotable(label: impl Into<String>, gc: GcHooks) -> Self {
        Self::from_body(
            ObjBody::Remotable {
                label: label.into(),
            },
            None,
            gc,
        )
    }

    pub(crate) fn presence(vref: Vref, gc: GcHooks) -> Self {
        Self::from_body(ObjBody::Presence, Some(vref), gc)
    }

    pub(crate) fn promise(vref: Option<Vref>, gc: GcHooks) -> Self {
        Self::from_body(ObjBody::Promise, vref, gc)
    }

    pub(crate) fn device(vref: Vref, gc: GcHooks) -> Self {
        Self::from_body(ObjBody::Device, Some(vref), gc)
    }

    pub(crate) fn representative(
        runtime: Rc<KindRuntime>,
        base_ref: Vref,
        gc: GcHooks,
    ) -> Self {
        Self::from_body(
            ObjBody::Representative { runtime },
            Some(base_ref),
            gc,
        )
    }

    pub(crate) fn from_parts(core: Rc<ObjCore>, facet: Option<u32>) -> Self {
        Self { core, facet }
    }

    pub(crate) fn key(&self) -> HandleKey {
        HandleKey(Rc::as_ptr(&self.core) as usize, self.facet)
    }

    /// Assign the vref a remotable or promise receives on first export.
    pub(crate) fn assign_vref(&self, vref: Vref) {
        let mut slot = self.core.vref.borrow_mut();
        assert!(slot.is_none(), "vref already assigned to {self:?}");
        *slot = Some(vref);
    }

    /// The vref this handle serializes as, if it has one.
    ///
    /// Remotables and local promises have no vref until first exported.
    /// The cohort view of a faceted object has none either: only its
    /// individual facets are passable.
    pub fn vref(&self) -> Option<Vref> {
        let base = self.core.vref.borrow().clone()?;
        match (&self.core.body, self.facet) {
            (ObjBody::Representative { .. }, Some(index)) => {
                Some(base.with_facet(index))
            }
            (ObjBody::Representative { runtime }, None)
                if runtime.facet_names().is_some() =>
            {
                None
            }
            _ => Some(base),
        }
    }

    /// Base ref shared by every facet of this object, or the plain vref
    /// for unfaceted objects.
    pub(crate) fn base_ref(&self) -> Option<Vref> {
        self.core.vref.borrow().clone()
    }

    /// True when this is the whole-cohort view of a faceted object.
    pub fn is_cohort(&self) -> bool {
        matches!(&self.core.body, ObjBody::Representative { runtime }
            if runtime.facet_names().is_some() && self.facet.is_none())
    }

    /// Diagnostic label for remotables.
    pub fn label(&self) -> Option<&str> {
        match &self.core.body {
            ObjBody::Remotable { label } => Some(label),
            _ => None,
        }
    }

    /// The kind tag for representatives.
    pub fn kind_tag(&self) -> Option<String> {
        match &self.core.body {
            ObjBody::Representative { runtime } => Some(runtime.tag().to_string()),
            _ => None,
        }
    }

    /// This facet's name, for facet views of a faceted object.
    pub fn facet_name(&self) -> Option<String> {
        let names = self.core.facet_names()?;
        let index = self.facet? as usize;
        names.get(index).map(String::clone)
    }

    pub(crate) fn runtime(&self) -> Option<Rc<KindRuntime>> {
        match &self.core.body {
            ObjBody::Representative { runtime } => Some(Rc::clone(runtime)),
            _ => None,
        }
    }

    /// View of one facet of this object's core, or the whole object when
    /// `facet` is `None`. Facet indices are bounds-checked against the
    /// cohort's shape; a facet on an unfaceted object is an error.
    pub(crate) fn facet_view(&self, facet: Option<u32>) -> Result<ObjHandle, SlotError> {
        let described = || {
            self.base_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| format!("{self:?}"))
        };
        match (self.core.facet_names(), facet) {
            (Some(names), Some(index)) => {
                if index as usize >= names.len() {
                    return Err(SlotError::FacetOutOfRange {
                        base_ref: described(),
                        facet: index,
                    });
                }
                Ok(ObjHandle::from_parts(Rc::clone(&self.core), Some(index)))
            }
            (None, Some(_)) => Err(SlotError::UnexpectedFacet(described())),
            _ => Ok(ObjHandle::from_parts(Rc::clone(&self.core), None)),
        }
    }

    /// The vref under which weak collections index this object, when it
    /// is recognized by vref rather than by RAM identity.
    ///
    /// Virtual objects, durable objects, and imports qualify; plain
    /// remotables, promises, and devices are identified in RAM only.
    pub(crate) fn vref_key(&self) -> Option<Vref> {
        let vref = self.vref()?;
        let slot = parse_vat_slot(vref.as_str()).ok()?;
        let recognized_by_vref = slot.slot_type == SlotType::Object
            && (slot.virtualized || slot.durable || !slot.allocated_by_vat);
        recognized_by_vref.then_some(vref)
    }
}

impl PartialEq for ObjHandle {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core) && self.facet == other.facet
    }
}

impl Eq for ObjHandle {}

// Manual impl: kind runtimes hold behavior closures and cannot derive Debug.
impl fmt::Debug for ObjHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vref = self.core.vref.borrow();
        let mut dbg = f.debug_struct("ObjHandle");
        dbg.field("body", &self.core.body.kind_name());
        if let ObjBody::Remotable { label } = &self.core.body {
            dbg.field("label", label);
        }
        dbg.field("vref", &vref.as_ref().map(Vref::as_str))
            .field("facet", &self.facet)
            .finish()
    }
}
