//! Virtual-object lifecycle tests.
//!
//! Drives creation, paging, the reachability legs (live handle, kernel
//! export, stored reference), and deletion cascades entirely through the
//! public `Vat` surface, asserting persisted rows through the backing
//! store.

use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::json;
use swapvat::{
    BehaviorSpec, Kind, MemoryVatStore, MethodTable, Value, Vat, VatConfig, VatStore, Vref,
};

/// A vat over a fresh in-memory store, with the store kept out for row
/// assertions.
fn fresh_vat() -> (Vat, Rc<MemoryVatStore>) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::ERROR)
        .try_init();
    let store = Rc::new(MemoryVatStore::new());
    let vat = Vat::new(Rc::clone(&store) as Rc<dyn VatStore>, VatConfig::default());
    (vat, store)
}

/// A kind with one data field and a reader method.
fn note_kind(vat: &Vat) -> Kind {
    vat.define_kind(
        "note",
        |args| BTreeMap::from([("text".to_string(), args[0].clone())]),
        BehaviorSpec::Single(
            MethodTable::new().with("text", |ctx, _args| ctx.state().get("text")),
        ),
    )
    .unwrap()
}

/// A kind holding one reference-bearing field, with read, replace, and
/// clear methods.
fn holder_kind(vat: &Vat) -> Kind {
    vat.define_kind(
        "holder",
        |args| BTreeMap::from([("item".to_string(), args[0].clone())]),
        BehaviorSpec::Single(
            MethodTable::new()
                .with("item", |ctx, _args| ctx.state().get("item"))
                .with("replace", |ctx, args| {
                    let old = ctx.state().get("item")?;
                    ctx.state().set("item", &args[0])?;
                    Ok(old)
                })
                .with("clear", |ctx, _args| {
                    ctx.state().set("item", &Value::data(json!(null)))?;
                    Ok(Value::data(json!(null)))
                }),
        ),
    )
    .unwrap()
}

/// A kind with a numeric field and an increment method.
fn counter_kind(vat: &Vat) -> Kind {
    vat.define_kind(
        "counter",
        |args| BTreeMap::from([("count".to_string(), args[0].clone())]),
        BehaviorSpec::Single(
            MethodTable::new()
                .with("get", |ctx, _args| ctx.state().get("count"))
                .with("add", |ctx, args| {
                    let count: i64 = ctx.state().get_data("count")?;
                    let delta: i64 = args[0].to_data()?;
                    ctx.state().set_data("count", &(count + delta))?;
                    Ok(Value::data(json!(count + delta)))
                }),
        ),
    )
    .unwrap()
}

#[test]
fn stored_reference_keeps_a_virtual_object_alive() {
    let (vat, store) = fresh_vat();
    let note = note_kind(&vat);
    let holder = holder_kind(&vat);

    let n = note.make(&[Value::data(json!("remember me"))]).unwrap();
    let n_vref = n.vref().unwrap();
    assert_eq!(n_vref.as_str(), "o+v2/1");

    let h = holder.make(&[Value::handle(n.clone())]).unwrap();
    assert_eq!(store.get("vom.rc.o+v2/1").as_deref(), Some("1"));

    // The stored reference outlives the in-RAM handle.
    drop(n);
    assert!(vat.run_gc_sweep().unwrap().is_empty());
    assert!(store.get("vom.o+v2/1").is_some());

    // Reading the field revives the same object.
    let item = h.invoke("item", &[]).unwrap();
    let revived = item.to_handle().unwrap();
    assert_eq!(revived.vref().unwrap(), n_vref);
    assert_eq!(
        revived.invoke("text", &[]).unwrap(),
        Value::data(json!("remember me"))
    );

    // Clearing the field releases the last leg.
    drop(item);
    drop(revived);
    h.invoke("clear", &[]).unwrap();
    let report = vat.run_gc_sweep().unwrap();
    assert!(report.deleted.contains(&n_vref));
    assert!(store.get("vom.o+v2/1").is_none());
    assert!(store.get("vom.rc.o+v2/1").is_none());
}

#[test]
fn representatives_reanimate_with_identity() {
    let (vat, store) = fresh_vat();
    let counter = counter_kind(&vat);

    let c = counter.make(&[Value::data(json!(5))]).unwrap();
    let vref = c.vref().unwrap();

    // Serialization names the same slot every time.
    let data = vat.serialize(&Value::handle(c.clone())).unwrap();
    assert_eq!(data.slots, vec![vref.clone()]);
    assert_eq!(
        vat.serialize(&Value::handle(c.clone())).unwrap().slots,
        data.slots
    );

    // Keep it reachable from virtualized data, then drop the only
    // handle.
    vat.add_reachable_vref(&vref).unwrap();
    drop(c);
    assert!(vat.run_gc_sweep().unwrap().is_empty());

    // Unserializing the slot builds a fresh representative over the
    // same state.
    let value = vat.unserialize(&data).unwrap();
    let c = value.to_handle().unwrap();
    assert_eq!(c.vref().unwrap(), vref);
    assert_eq!(c.invoke("get", &[]).unwrap(), Value::data(json!(5)));
    c.invoke("add", &[Value::data(json!(3))]).unwrap();
    assert_eq!(c.invoke("get", &[]).unwrap(), Value::data(json!(8)));

    // Releasing both the data reference and the handles deletes it.
    assert!(!vat.remove_reachable_vref(&vref).unwrap());
    drop(value);
    drop(c);
    let report = vat.run_gc_sweep().unwrap();
    assert!(report.deleted.contains(&vref));
    assert!(store.get("vom.o+v2/1").is_none());
}

#[test]
fn export_status_tracks_kernel_reachability() {
    let (vat, store) = fresh_vat();
    let note = note_kind(&vat);

    let n = note.make(&[Value::data(json!("exported"))]).unwrap();
    let vref = vat.export(&n).unwrap();
    assert_eq!(vref.as_str(), "o+v2/1");
    assert_eq!(store.get("vom.es.o+v2/1").as_deref(), Some("r"));

    // Kernel reachability alone keeps it alive.
    drop(n);
    assert!(vat.run_gc_sweep().unwrap().is_empty());
    assert!(store.get("vom.o+v2/1").is_some());

    // Dropped to merely recognizable: nothing else retains it, so it
    // dies, and the kernel is told to retire the vref it still knows.
    vat.drop_export("o+v2/1").unwrap();
    assert_eq!(store.get("vom.es.o+v2/1").as_deref(), Some("s"));
    let report = vat.run_gc_sweep().unwrap();
    assert!(report.deleted.contains(&vref));
    assert!(report.retire_exports.contains(&vref));
    assert!(store.get("vom.o+v2/1").is_none());
    assert!(store.get("vom.es.o+v2/1").is_none());
}

#[test]
fn retired_exports_die_without_kernel_notice() {
    let (vat, store) = fresh_vat();
    let note = note_kind(&vat);

    let n = note.make(&[Value::data(json!("retired"))]).unwrap();
    let vref = vat.export(&n).unwrap();
    drop(n);
    assert!(vat.run_gc_sweep().unwrap().is_empty());

    // The kernel retired the vref itself; it must not be told again.
    vat.drop_export("o+v2/1").unwrap();
    vat.retire_export("o+v2/1").unwrap();
    assert_eq!(store.get("vom.es.o+v2/1"), None);
    let report = vat.run_gc_sweep().unwrap();
    assert!(report.deleted.contains(&vref));
    assert!(report.retire_exports.is_empty());
}

#[test]
fn reference_counts_follow_slot_lists() {
    let (vat, store) = fresh_vat();
    let note = note_kind(&vat);
    let a = note.make(&[Value::data(json!("a"))]).unwrap();
    let b = note.make(&[Value::data(json!("b"))]).unwrap();
    let a_vref = a.vref().unwrap();
    let b_vref = b.vref().unwrap();

    vat.add_reachable_vref(&a_vref).unwrap();
    vat.add_reachable_vref(&a_vref).unwrap();
    vat.add_reachable_vref(&b_vref).unwrap();
    assert_eq!(store.get("vom.rc.o+v2/1").as_deref(), Some("2"));
    assert_eq!(store.get("vom.rc.o+v2/2").as_deref(), Some("1"));

    // A slot present in both lists is untouched; a drops one appearance.
    vat.update_reference_counts(
        &[a_vref.clone(), b_vref.clone()],
        std::slice::from_ref(&b_vref),
    )
    .unwrap();
    assert_eq!(store.get("vom.rc.o+v2/1").as_deref(), Some("1"));
    assert_eq!(store.get("vom.rc.o+v2/2").as_deref(), Some("1"));

    // Duplicates within one list count once.
    vat.update_reference_counts(&[a_vref.clone(), a_vref.clone(), b_vref.clone()], &[])
        .unwrap();
    assert_eq!(store.get("vom.rc.o+v2/1"), None);
    assert_eq!(store.get("vom.rc.o+v2/2"), None);

    drop(a);
    drop(b);
    let report = vat.run_gc_sweep().unwrap();
    assert_eq!(report.deleted.len(), 2);
}

#[test]
fn deletion_cascades_through_stored_state() {
    let (vat, store) = fresh_vat();
    let holder = holder_kind(&vat);
    let note = note_kind(&vat);

    let leaf = note.make(&[Value::data(json!("leaf"))]).unwrap();
    let middle = holder.make(&[Value::handle(leaf)]).unwrap();
    let outer = holder.make(&[Value::handle(middle)]).unwrap();
    let outer_vref = outer.vref().unwrap();

    vat.flush().unwrap();
    assert_eq!(store.get("vom.rc.o+v3/1").as_deref(), Some("1"));
    assert_eq!(store.get("vom.rc.o+v2/1").as_deref(), Some("1"));

    // Only the outer handle retains the chain; dropping it takes all
    // three down in one sweep.
    drop(outer);
    let report = vat.run_gc_sweep().unwrap();
    assert_eq!(report.deleted.len(), 3);
    assert!(report.deleted.contains(&outer_vref));
    for key in store.keys() {
        assert!(!key.starts_with("vom.o+"), "leftover state row {key}");
        assert!(!key.starts_with("vom.rc."), "leftover refcount row {key}");
    }
}

#[test]
#[should_panic(expected = "refcount below zero")]
fn refcount_underflow_panics() {
    let (vat, _store) = fresh_vat();
    let note = note_kind(&vat);
    let n = note.make(&[Value::data(json!("n"))]).unwrap();
    let vref = n.vref().unwrap();
    vat.add_reachable_vref(&vref).unwrap();
    vat.remove_reachable_vref(&vref).unwrap();
    let _ = vat.remove_reachable_vref(&vref);
}

#[test]
fn overwriting_state_releases_the_old_reference() {
    let (vat, store) = fresh_vat();
    let holder = holder_kind(&vat);
    let note = note_kind(&vat);

    let first = note.make(&[Value::data(json!("first"))]).unwrap();
    let second = note.make(&[Value::data(json!("second"))]).unwrap();
    let first_vref = first.vref().unwrap();
    let second_vref = second.vref().unwrap();

    let h = holder.make(&[Value::handle(first)]).unwrap();
    let old = h.invoke("replace", &[Value::handle(second)]).unwrap();
    assert_eq!(old.to_handle().unwrap().vref().unwrap(), first_vref);
    assert_eq!(store.get("vom.rc.o+v3/1"), None);
    assert_eq!(store.get("vom.rc.o+v3/2").as_deref(), Some("1"));

    // The returned old value was the last thing keeping it alive.
    drop(old);
    let report = vat.run_gc_sweep().unwrap();
    assert!(report.deleted.contains(&first_vref));
    assert!(!report.deleted.contains(&second_vref));
}

#[test]
fn cache_eviction_writes_state_through() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::ERROR)
        .try_init();
    let store = Rc::new(MemoryVatStore::new());
    let vat = Vat::new(
        Rc::clone(&store) as Rc<dyn VatStore>,
        VatConfig::default().with_cache_size(1),
    );
    let counter = counter_kind(&vat);

    let c1 = counter.make(&[Value::data(json!(1))]).unwrap();
    assert!(store.get("vom.o+v2/1").is_none());

    // Making a second instance evicts the first, writing it through.
    let c2 = counter.make(&[Value::data(json!(2))]).unwrap();
    assert!(store.get("vom.o+v2/1").is_some());

    // Touching the first faults it back in and pushes the second out.
    c1.invoke("add", &[Value::data(json!(10))]).unwrap();
    assert!(store.get("vom.o+v2/2").is_some());

    vat.flush().unwrap();
    let row: serde_json::Value =
        serde_json::from_str(&store.get("vom.o+v2/1").unwrap()).unwrap();
    assert_eq!(row["count"]["body"], json!(11));
    drop(c2);
}

#[test]
fn facets_share_state_and_die_together() {
    let (vat, store) = fresh_vat();
    let tally = vat
        .define_kind_multi(
            "tally",
            |_args| BTreeMap::from([("total".to_string(), Value::data(json!(0)))]),
            BehaviorSpec::Multi(BTreeMap::from([
                (
                    "bump".to_string(),
                    MethodTable::new().with("add", |ctx, args| {
                        let total: i64 = ctx.state().get_data("total")?;
                        let delta: i64 = args[0].to_data()?;
                        ctx.state().set_data("total", &(total + delta))?;
                        Ok(Value::data(json!(null)))
                    }),
                ),
                (
                    "read".to_string(),
                    MethodTable::new().with("total", |ctx, _args| ctx.state().get("total")),
                ),
            ])),
        )
        .unwrap();

    let cohort = tally.make(&[]).unwrap();
    let bump = cohort.facet("bump").unwrap();
    let read = cohort.facet("read").unwrap();

    // Facet vrefs share a baseRef; the cohort itself has no wire name.
    assert_eq!(bump.vref().unwrap().as_str(), "o+v2/1:0");
    assert_eq!(read.vref().unwrap().as_str(), "o+v2/1:1");
    assert!(vat.serialize(&Value::handle(cohort.clone())).is_err());

    bump.invoke("add", &[Value::data(json!(7))]).unwrap();
    assert_eq!(read.invoke("total", &[]).unwrap(), Value::data(json!(7)));
    assert!(bump.invoke("total", &[]).is_err());

    drop(bump);
    drop(read);
    drop(cohort);
    let report = vat.run_gc_sweep().unwrap();
    assert!(report.deleted.contains(&Vref::from("o+v2/1")));
    assert!(store.get("vom.o+v2/1").is_none());
}
