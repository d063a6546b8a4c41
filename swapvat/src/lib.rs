//! # Swapvat: virtual objects with distributed-GC bookkeeping
//!
//! This crate implements the vat-side half of object virtualization for
//! a message-passing kernel: objects whose state lives in an ordered
//! key-value store instead of RAM, reachable from other vats through
//! reference strings ("vrefs"), with precise bookkeeping of when an
//! object can be deleted and when the kernel must be told about it.
//!
//! ## The model
//!
//! A *virtual object* belongs to a *kind* (tag + init function +
//! behavior). Making an instance writes its state record to the store
//! and hands back a *representative*: a thin in-RAM [`ObjHandle`] that
//! can be dropped at any time and rebuilt ("reanimated") on demand.
//! *Durable* kinds additionally survive restarts; each incarnation
//! reattaches behavior through a stored *kind handle*.
//!
//! An object stays alive while any of four legs holds it up:
//!
//! | Leg | Holder | Evidence |
//! |-----|--------|----------|
//! | L | this vat's RAM | a live handle in the slot table |
//! | E | the kernel | `r` in the export-status row |
//! | V | virtualized data | a nonzero refcount row |
//! | R | weak collections | recognizer entries (RAM or persisted) |
//!
//! Dropping the last handle only *enqueues* the object as possibly
//! dead. [`Vat::run_gc_sweep`] later checks the remaining legs, deletes
//! what nothing holds, cascades through whatever the deleted state
//! referenced, and reports the kernel-visible consequences as a
//! [`SweepReport`]. Nothing in this crate issues kernel syscalls; the
//! embedder forwards the report.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Vat: facade, exports, kernel deliveries, GC sweep        │
//! ├────────────┬───────────────┬─────────────────────────────┤
//! │ ValueCodec │ ObjectManager │ VatWeakMap / VatWeakSet     │
//! │ Value <->  │ kinds and     │ vref- and identity-keyed    │
//! │ CapData    │ kind handles  │ weak entries                │
//! ├────────────┴───────┬───────┴─────────────────────────────┤
//! │ KindRuntime: make / reanimate / invoke / delete stored   │
//! ├──────────┬─────────┴──────────┬──────────────────────────┤
//! │SlotTable │ ReferenceManager   │ StateCache               │
//! │vref to   │ refcounts, export  │ LRU over state records,  │
//! │weak core │ status, recognizers│ write-back on eviction   │
//! ├──────────┴────────────────────┴──────────────────────────┤
//! │ VatStore: ordered key-value rows (vom.*, counters)       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Crate organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`vat`] | [`Vat`] facade, kernel deliveries, [`SweepReport`] |
//! | [`kind`] | Kind definition, behavior tables, instance state |
//! | [`handle`] | [`ObjHandle`] identity and drop tracking |
//! | [`weak`] | [`VatWeakMap`] / [`VatWeakSet`] |
//! | [`codec`] | [`Value`] / [`CapData`] translation |
//! | [`slot`] | Vref grammar and parsing |
//! | [`store`] | [`VatStore`] trait and the in-memory store |
//! | [`config`] | [`VatConfig`] |
//! | [`error`] | Error taxonomy |

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod handle;
pub mod kind;
mod objects;
mod refs;
pub mod slot;
pub mod store;
mod table;
pub mod vat;
pub mod weak;

// Re-export key types at crate root for convenience
pub use codec::{CapData, Value};
pub use config::VatConfig;
pub use error::{KindError, SlotError, StateError};
pub use handle::ObjHandle;
pub use kind::{BehaviorSpec, InstanceBuilder, InvokeCtx, Kind, MethodTable, StateRef};
pub use slot::Vref;
pub use store::{MemoryVatStore, VatStore};
pub use vat::{RetentionStats, SweepReport, Vat};
pub use weak::{VatWeakMap, VatWeakSet};
