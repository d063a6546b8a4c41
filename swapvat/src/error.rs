//! Error types for the virtualization layer.
//!
//! Errors split along the taxonomy the rest of the crate relies on:
//!
//! - [`SlotError`]: a vref string failed to parse or was the wrong shape
//!   for the operation.
//! - [`KindError`]: kind definition or reconnection went wrong.
//! - [`StateError`]: everything that can fail while creating, reading,
//!   writing, serializing, or collecting virtual-object state.
//!
//! All of these are usage errors: the caller handed us something invalid
//! and the operation is refused. Consistency violations (a refcount
//! driven below zero, a corrupt stored row) panic instead, because they
//! mean the persistent bookkeeping can no longer be trusted.

use thiserror::Error;

/// Errors produced while parsing or classifying vat slots (vrefs).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    /// The slot string was empty.
    #[error("empty vat slot")]
    Empty,

    /// The slot string did not match the vref grammar.
    #[error("invalid vat slot `{0}`")]
    Invalid(String),

    /// A numeric component of the slot failed to parse.
    #[error("invalid number in vat slot `{slot}`")]
    InvalidNumber {
        /// The offending slot string.
        slot: String,
    },

    /// A facet suffix appeared where only a baseRef is accepted.
    #[error("vat slot `{0}` must not carry a facet here")]
    UnexpectedFacet(String),

    /// A facet index named a facet the kind does not have.
    #[error("facet {facet} out of range for `{base_ref}`")]
    FacetOutOfRange {
        /// The baseRef whose cohort was probed.
        base_ref: String,
        /// The out-of-range facet index.
        facet: u32,
    },

    /// The slot is not an import, but an import was required.
    #[error("vat slot `{0}` is not an import")]
    NotAnImport(String),
}

/// Errors produced while defining kinds or reconnecting durable kinds.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KindError {
    /// A single-facet behavior was given to the multi-facet entry point,
    /// or vice versa.
    #[error("behavior for kind `{tag}` does not match the definition entry point")]
    BehaviorShape {
        /// Tag of the kind being defined.
        tag: String,
    },

    /// A multi-faceted kind must declare at least two facets.
    #[error("kind `{tag}` declares {count} facet(s); multi-faceted kinds need at least two")]
    TooFewFacets {
        /// Tag of the kind being defined.
        tag: String,
        /// Number of facets declared.
        count: usize,
    },

    /// A facet name was empty or contained vref delimiter characters.
    #[error("kind `{tag}` has invalid facet name `{name}`")]
    InvalidFacetName {
        /// Tag of the kind being defined.
        tag: String,
        /// The offending facet name.
        name: String,
    },

    /// No kind with this ID has been registered this incarnation.
    #[error("unknown kind {0}; kinds must be defined before deserialization")]
    Unknown(u64),

    /// The value passed as a durable kind handle is not one.
    #[error("unknown durable kind handle")]
    UnknownHandle,

    /// No persisted descriptor exists for this durable kind ID.
    #[error("unknown durable kind ID {0}")]
    UnknownDescriptor(u64),

    /// A durable kind was defined twice in one incarnation.
    #[error("redefinition of durable kind `{tag}`")]
    Redefined {
        /// Tag of the kind being redefined.
        tag: String,
    },

    /// A durable kind was redefined with different facetiousness than its
    /// persisted descriptor records.
    #[error("durable kind `{tag}` facet mismatch with persisted descriptor")]
    FacetMismatch {
        /// Tag of the kind being redefined.
        tag: String,
    },

    /// Durable kinds found in the store were not redefined this
    /// incarnation.
    #[error("durable kinds not reconnected: [{tags}]")]
    Unreconnected {
        /// Comma-joined tags of the missing kinds.
        tags: String,
    },
}

/// Errors produced while creating, accessing, or collecting virtual
/// objects and the values flowing through them.
#[derive(Debug, Error)]
pub enum StateError {
    /// Wraps a slot parse failure encountered mid-operation.
    #[error(transparent)]
    Slot(#[from] SlotError),

    /// Wraps a kind definition or lookup failure.
    #[error(transparent)]
    Kind(#[from] KindError),

    /// A persisted row failed to encode or decode.
    #[error("state serialization failed")]
    Serde(#[from] serde_json::Error),

    /// A field name not fixed at instantiation time was accessed.
    #[error("`{base_ref}` has no state field `{field}`")]
    UnknownField {
        /// The object whose state was accessed.
        base_ref: String,
        /// The missing field name.
        field: String,
    },

    /// No stored state exists for an object that should have some.
    #[error("no stored state for `{0}`")]
    MissingState(String),

    /// A value stored in durable state referenced something non-durable.
    #[error("value for field `{field}` is not durable: slot {index} (`{vref}`)")]
    NotDurable {
        /// The state field being written.
        field: String,
        /// Index into the value's slot list.
        index: usize,
        /// The non-durable vref.
        vref: String,
    },

    /// A representative or cohort is already live for this baseRef.
    #[error("`{0}` already has a live representative")]
    AlreadyRepresented(String),

    /// A slot named an object with no live handle and no way to rebuild
    /// one.
    #[error("no live value for slot `{0}`")]
    UnknownSlot(String),

    /// A facet cohort record has no vref and cannot be serialized.
    #[error("facet cohort records cannot be serialized")]
    CohortNotSerializable,

    /// Method invocation was attempted on something that has no methods.
    #[error("`{0}` is not an invokable representative")]
    NotInvokable(String),

    /// The named method does not exist on the invoked facet.
    #[error("kind `{tag}` has no method `{name}` on the invoked facet")]
    UnknownMethod {
        /// Tag of the kind.
        tag: String,
        /// The missing method name.
        name: String,
    },

    /// A facet was requested by a name the kind does not declare.
    #[error("kind `{tag}` has no facet named `{name}`")]
    UnknownFacetName {
        /// Tag of the kind.
        tag: String,
        /// The missing facet name.
        name: String,
    },

    /// A facets accessor was used on an unfaceted kind, or a self
    /// accessor on a faceted one.
    #[error("kind `{tag}` is not {expected}")]
    WrongFacetiousness {
        /// Tag of the kind.
        tag: String,
        /// What the accessor expected ("multi-faceted" or "single-faceted").
        expected: &'static str,
    },
}
