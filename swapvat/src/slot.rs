//! Vat slot (vref) grammar.
//!
//! Every object the vat can talk about is named by a short string called
//! a vref. The grammar is small but load-bearing: the prefix says who
//! allocated the object and whether it lives in RAM or in the store, and
//! the suffix addresses one facet of a multi-faceted object.
//!
//! ```text
//! o+v<kind>/<instance>[:<facet>]   virtual object (or one facet of it)
//! o+d<kind>/<instance>[:<facet>]   durable object (or one facet of it)
//! o+<n>                            plain export (remotable)
//! o-<n>                            import (presence)
//! p+<n> / p-<n>                    promise
//! d+<n> / d-<n>                    device node
//! ```
//!
//! The *baseRef* is the vref with any `:facet` suffix removed; all
//! per-object storage and identity is keyed by baseRef.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SlotError;

/// A vref string. Cheap to clone, ordered lexicographically, usable as a
/// store key fragment.
///
/// Construction does not validate; [`parse_vat_slot`] is the validating
/// entry point, applied wherever a vref crosses into this subsystem.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vref(String);

impl Vref {
    /// Wrap a string as a vref without validating it.
    pub fn new(s: impl Into<String>) -> Self {
        Vref(s.into())
    }

    /// The underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The vref extended with a facet suffix.
    pub fn with_facet(&self, facet: u32) -> Vref {
        Vref(format!("{}:{facet}", self.0))
    }
}

impl fmt::Display for Vref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Vref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vref({})", self.0)
    }
}

impl From<&str> for Vref {
    fn from(s: &str) -> Self {
        Vref(s.to_string())
    }
}

impl From<String> for Vref {
    fn from(s: String) -> Self {
        Vref(s)
    }
}

/// What species of entity a slot names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotType {
    /// An object (exported, imported, virtual, or durable).
    Object,
    /// A promise.
    Promise,
    /// A device node.
    Device,
}

/// The decomposition of a vref into its grammar components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VatSlot {
    /// Object, promise, or device.
    pub slot_type: SlotType,
    /// True for `+` slots (allocated by this vat), false for `-` slots.
    pub allocated_by_vat: bool,
    /// True for `o+v` slots.
    pub virtualized: bool,
    /// True for `o+d` slots.
    pub durable: bool,
    /// The export number, or the kind ID for virtual/durable slots.
    pub id: u64,
    /// The instance number, present only for virtual/durable slots.
    pub subid: Option<u64>,
    /// The facet index, present only on facet vrefs.
    pub facet: Option<u32>,
    /// The vref with any facet suffix removed.
    pub base_ref: Vref,
}

impl VatSlot {
    /// True when the slot names a virtual or durable object managed by
    /// this subsystem (as opposed to a plain export or an import).
    pub fn is_virtual_object(&self) -> bool {
        self.virtualized || self.durable
    }
}

/// Form the baseRef for an instance of a kind.
pub fn make_base_ref(kind_id: u64, instance: u64, durable: bool) -> Vref {
    let marker = if durable { 'd' } else { 'v' };
    Vref(format!("o+{marker}{kind_id}/{instance}"))
}

fn number(slot: &str, digits: &str) -> Result<u64, SlotError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SlotError::InvalidNumber {
            slot: slot.to_string(),
        });
    }
    digits.parse().map_err(|_| SlotError::InvalidNumber {
        slot: slot.to_string(),
    })
}

/// Parse a vref string into its components.
///
/// Malformed slots are usage errors; nothing about a slot string is ever
/// guessed at.
pub fn parse_vat_slot(slot: &str) -> Result<VatSlot, SlotError> {
    let mut chars = slot.chars();
    let type_char = chars.next().ok_or(SlotError::Empty)?;
    let slot_type = match type_char {
        'o' => SlotType::Object,
        'p' => SlotType::Promise,
        'd' => SlotType::Device,
        _ => return Err(SlotError::Invalid(slot.to_string())),
    };
    let allocated_by_vat = match chars.next() {
        Some('+') => true,
        Some('-') => false,
        _ => return Err(SlotError::Invalid(slot.to_string())),
    };
    let rest = chars.as_str();

    let (virtualized, durable, body) = match (slot_type, allocated_by_vat) {
        (SlotType::Object, true) => match rest.as_bytes().first() {
            Some(b'v') => (true, false, &rest[1..]),
            Some(b'd') => (false, true, &rest[1..]),
            _ => (false, false, rest),
        },
        _ => (false, false, rest),
    };

    if virtualized || durable {
        let (kind_part, instance_part) = body
            .split_once('/')
            .ok_or_else(|| SlotError::Invalid(slot.to_string()))?;
        let (instance_part, facet_part) = match instance_part.split_once(':') {
            Some((i, f)) => (i, Some(f)),
            None => (instance_part, None),
        };
        let id = number(slot, kind_part)?;
        let subid = number(slot, instance_part)?;
        let facet = facet_part
            .map(|f| number(slot, f).map(|n| n as u32))
            .transpose()?;
        let marker = if durable { 'd' } else { 'v' };
        let base_ref = Vref(format!("o+{marker}{id}/{subid}"));
        Ok(VatSlot {
            slot_type,
            allocated_by_vat,
            virtualized,
            durable,
            id,
            subid: Some(subid),
            facet,
            base_ref,
        })
    } else {
        let id = number(slot, body)?;
        Ok(VatSlot {
            slot_type,
            allocated_by_vat,
            virtualized: false,
            durable: false,
            id,
            subid: None,
            facet: None,
            base_ref: Vref(slot.to_string()),
        })
    }
}

/// Parse a slot and insist it carries no facet suffix.
///
/// Refcount and storage rows are keyed by baseRef; handing them an
/// individual facet is a bug in the caller.
pub fn parse_base_ref(slot: &str) -> Result<VatSlot, SlotError> {
    let parsed = parse_vat_slot(slot)?;
    if parsed.facet.is_some() {
        return Err(SlotError::UnexpectedFacet(slot.to_string()));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_virtual_object_slots() {
        let slot = parse_vat_slot("o+v10/5").unwrap();
        assert_eq!(slot.slot_type, SlotType::Object);
        assert!(slot.allocated_by_vat);
        assert!(slot.virtualized);
        assert!(!slot.durable);
        assert_eq!(slot.id, 10);
        assert_eq!(slot.subid, Some(5));
        assert_eq!(slot.facet, None);
        assert_eq!(slot.base_ref.as_str(), "o+v10/5");
    }

    #[test]
    fn parses_facet_slots() {
        let slot = parse_vat_slot("o+v10/5:1").unwrap();
        assert_eq!(slot.facet, Some(1));
        assert_eq!(slot.base_ref.as_str(), "o+v10/5");
        assert_eq!(slot.base_ref.with_facet(1).as_str(), "o+v10/5:1");
    }

    #[test]
    fn parses_durable_slots() {
        let slot = parse_vat_slot("o+d7/3").unwrap();
        assert!(slot.durable);
        assert!(!slot.virtualized);
        assert!(slot.is_virtual_object());
        assert_eq!(slot.base_ref.as_str(), "o+d7/3");
    }

    #[test]
    fn parses_plain_exports_imports_promises_devices() {
        let export = parse_vat_slot("o+8").unwrap();
        assert!(export.allocated_by_vat);
        assert!(!export.is_virtual_object());
        assert_eq!(export.id, 8);

        let import = parse_vat_slot("o-3").unwrap();
        assert!(!import.allocated_by_vat);
        assert_eq!(import.base_ref.as_str(), "o-3");

        let promise = parse_vat_slot("p+5").unwrap();
        assert_eq!(promise.slot_type, SlotType::Promise);

        let device = parse_vat_slot("d-1").unwrap();
        assert_eq!(device.slot_type, SlotType::Device);
    }

    #[test]
    fn round_trips_base_ref_construction() {
        assert_eq!(make_base_ref(10, 5, false).as_str(), "o+v10/5");
        assert_eq!(make_base_ref(10, 5, true).as_str(), "o+d10/5");
        let parsed = parse_vat_slot(make_base_ref(12, 9, true).as_str()).unwrap();
        assert_eq!(parsed.id, 12);
        assert_eq!(parsed.subid, Some(9));
        assert!(parsed.durable);
    }

    #[test]
    fn rejects_malformed_slots() {
        assert_eq!(parse_vat_slot(""), Err(SlotError::Empty));
        assert!(matches!(parse_vat_slot("x+1"), Err(SlotError::Invalid(_))));
        assert!(matches!(parse_vat_slot("o*1"), Err(SlotError::Invalid(_))));
        assert!(matches!(
            parse_vat_slot("o+v10"),
            Err(SlotError::Invalid(_))
        ));
        assert!(matches!(
            parse_vat_slot("o+v10/"),
            Err(SlotError::InvalidNumber { .. })
        ));
        assert!(matches!(
            parse_vat_slot("o+vx/1"),
            Err(SlotError::InvalidNumber { .. })
        ));
        assert!(matches!(
            parse_vat_slot("o+v1/2:"),
            Err(SlotError::InvalidNumber { .. })
        ));
        assert!(matches!(
            parse_vat_slot("o+12x"),
            Err(SlotError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn base_ref_guard_rejects_facets() {
        assert!(parse_base_ref("o+v10/5").is_ok());
        assert_eq!(
            parse_base_ref("o+v10/5:0"),
            Err(SlotError::UnexpectedFacet("o+v10/5:0".to_string()))
        );
    }

    #[test]
    fn import_slots_never_claim_virtualization() {
        let slot = parse_vat_slot("o-12").unwrap();
        assert!(!slot.virtualized);
        assert!(!slot.durable);
        assert!(!slot.is_virtual_object());
    }
}
