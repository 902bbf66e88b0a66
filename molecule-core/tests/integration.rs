//! Integration Tests for the State Engine
//!
//! These tests verify that atoms, filters, scopes and persistence work
//! together correctly through the public API.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use molecule_core::persist::{HostStorage, MemoryStorage, StorageProvider, SyncStorage};
use molecule_core::reactive::{
    Atom, DeferredOutcome, EffectOutcome, Filter, Store, WriteOutcome,
};
use molecule_core::{StateError, StoreConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Point {
    x: i32,
}

/// End to end: two readers of `clicks` follow every write, and a repeated
/// literal write does not notify.
#[test]
fn clicks_scenario() {
    let store = Store::new();
    let clicks = Atom::new("clicks", 0);

    let first = store.use_atom(&clicks);
    let second = store.use_atom(&clicks);

    first.update(|v| v + 1);
    assert_eq!(first.get(), Some(1));
    assert_eq!(second.get(), Some(1));

    first.set(5);
    assert_eq!(first.get(), Some(5));
    assert_eq!(second.get(), Some(5));

    let renders = second.render_count();
    assert_eq!(first.set(5), WriteOutcome::Unchanged);
    assert_eq!(second.render_count(), renders);
}

/// P1: writes through one consumer are read through another declaration.
#[test]
fn one_canonical_value_per_key() {
    let store = Store::new();
    let here = Atom::new("shared", 1);
    let there = Atom::new("shared", 1);

    let writer_side = store.use_atom(&here);
    let reader_side = store.use_atom(&there);

    writer_side.set(42);
    assert_eq!(reader_side.get(), Some(42));
    assert_eq!(store.root().atom_value(&there), Some(42));
}

/// P2: the writer's own subscription does not re-apply its value.
#[test]
fn writer_is_not_notified_of_its_own_write() {
    let store = Store::new();
    let atom = Atom::new("n", 0);
    let handle = store.use_atom(&atom);
    let applied = Arc::new(AtomicI32::new(0));

    let applied_clone = applied.clone();
    handle.on_render(move |_| {
        applied_clone.fetch_add(1, Ordering::SeqCst);
    });

    handle.set(1);
    handle.set(2);
    assert_eq!(applied.load(Ordering::SeqCst), 2);
}

/// P3 and P3b: equal writes are silent, except the first write of the
/// declared default.
#[test]
fn equal_writes_do_not_emit_except_first_default() {
    let store = Store::new();
    let atom = Atom::new("flag", 0);
    let reader = store.use_atom(&atom);
    let writer = store.root().writer(&atom);

    assert_eq!(writer.set(0), WriteOutcome::Committed);
    assert_eq!(reader.render_count(), 1);

    assert_eq!(writer.set(0), WriteOutcome::Unchanged);
    assert_eq!(reader.render_count(), 1);

    writer.set(3);
    assert_eq!(writer.set(3), WriteOutcome::Unchanged);
    assert_eq!(reader.render_count(), 2);
}

/// P4: a filter recomputes exactly once per dependency write.
#[test]
fn filter_recomputes_once_per_write() {
    let store = Store::new();
    let a = Atom::new("a", 2);
    let runs = Arc::new(AtomicI32::new(0));

    let (a_clone, runs_clone) = (a.clone(), runs.clone());
    let f = Filter::new("f", move |get| {
        runs_clone.fetch_add(1, Ordering::SeqCst);
        Ok(2 * get.get(&a_clone)?)
    });

    let first = store.use_filter(&f);
    let second = store.use_filter(&f);
    assert_eq!(first.get(), Some(4));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    store.root().writer(&a).set(5);
    assert_eq!(first.get(), Some(10));
    assert_eq!(second.get(), Some(10));
    assert_eq!(store.root().filter_value(&f), Some(10));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// P5: filters reading filters see the upstream value after it updated.
#[test]
fn filter_chain_propagates_in_dependency_order() {
    let store = Store::new();
    let a = Atom::new("a", 2);
    let order = Arc::new(Mutex::new(Vec::new()));

    let (a_clone, order_f) = (a.clone(), order.clone());
    let f = Filter::new("f", move |get| {
        let value = 2 * get.get(&a_clone)?;
        order_f.lock().push(("f", value));
        Ok(value)
    });

    let (f_clone, order_g) = (f.clone(), order.clone());
    let g = Filter::new("g", move |get| {
        let upstream = get.read(&f_clone)?;
        order_g.lock().push(("g", upstream));
        Ok(3 * upstream)
    });

    let view = store.use_filter(&g);
    assert_eq!(view.get(), Some(12));
    order.lock().clear();

    store.root().writer(&a).set(5);
    assert_eq!(store.root().filter_value(&f), Some(10));
    assert_eq!(view.get(), Some(30));
    assert_eq!(*order.lock(), vec![("f", 10), ("g", 10)]);
}

/// Diamond: a filter reading an atom both directly and through another
/// filter ends up consistent.
#[test]
fn diamond_dependencies_settle_on_fresh_values() {
    let store = Store::new();
    let a = Atom::new("a", 1);

    let a1 = a.clone();
    let doubled = Filter::new("doubled", move |get| Ok(get.get(&a1)? * 2));

    let (a2, d) = (a.clone(), doubled.clone());
    let sum = Filter::new("sum", move |get| Ok(get.get(&a2)? + get.get(&d)?));

    let view = store.use_filter(&sum);
    assert_eq!(view.get(), Some(3));

    store.root().writer(&a).set(4);
    assert_eq!(view.get(), Some(12));
}

/// P6: a value persisted by one mount hydrates the next.
#[tokio::test]
async fn persisted_values_hydrate_a_fresh_mount() {
    let memory = MemoryStorage::new();
    let point = Atom::builder("point")
        .default(Point { x: 0 })
        .persist(true)
        .build();

    let first = Store::with_storage(StoreConfig::default(), StorageProvider::sync(memory.clone()));
    first.use_atom(&point).set(Point { x: 1 });
    first.settled().await;
    assert_eq!(memory.peek("point").as_deref(), Some(r#"{"x":1}"#));

    let second = Store::with_storage(StoreConfig::default(), StorageProvider::sync(memory.clone()));
    let handle = second.use_atom(&point);
    assert_eq!(handle.get(), Some(Point { x: 0 }));

    second.settled().await;
    assert_eq!(handle.get(), Some(Point { x: 1 }));
}

/// Hydration never clobbers a write that happened before it finished.
#[tokio::test]
async fn early_writes_win_over_hydration() {
    let memory = MemoryStorage::with_items([("n", "5")]);
    let atom = Atom::builder("n").default(0).persist(true).build();
    let store = Store::with_storage(StoreConfig::default(), StorageProvider::sync(memory.clone()));

    let handle = store.use_atom(&atom);
    handle.set(7);
    store.settled().await;

    assert_eq!(handle.get(), Some(7));
    assert_eq!(memory.peek("n").as_deref(), Some("7"));
}

/// Unreadable stored values leave the default in place.
#[tokio::test]
async fn corrupt_storage_falls_back_to_the_default() {
    let memory = MemoryStorage::with_items([("p", "not json")]);
    let atom = Atom::builder("p").default(Point { x: 3 }).persist(true).build();
    let store = Store::with_storage(StoreConfig::default(), StorageProvider::sync(memory));

    let handle = store.use_atom(&atom);
    store.settled().await;
    assert_eq!(handle.get(), Some(Point { x: 3 }));
}

/// Asynchronous providers are written in the background.
#[tokio::test]
async fn async_providers_are_driven_to_completion() {
    let memory = MemoryStorage::new();
    let (m_get, m_set, m_remove) = (memory.clone(), memory.clone(), memory.clone());
    let provider = StorageProvider::from_async_fns(
        move |key| {
            let m = m_get.clone();
            async move { m.get_item(&key) }.boxed()
        },
        move |key, value| {
            let m = m_set.clone();
            async move { m.set_item(&key, &value) }.boxed()
        },
        move |key| {
            let m = m_remove.clone();
            async move { m.remove_item(&key) }.boxed()
        },
    );

    let atom = Atom::builder("count").default(0).persist(true).build();
    let scope = Store::new().scope("app").with_storage(provider);

    scope.use_atom(&atom).set(9);
    scope.store().settled().await;
    assert_eq!(memory.peek("app-count").as_deref(), Some("9"));

    scope.remove_persisted(&atom);
    scope.store().settled().await;
    assert_eq!(memory.peek("app-count"), None);
    assert_eq!(scope.atom_value(&atom), Some(9));
}

/// P7: the same short name in two scopes is two values.
#[test]
fn scopes_are_isolated() {
    let store = Store::new();
    let count = Atom::new("count", 0);

    let a = store.scope("A").use_atom(&count);
    let b = store.scope("B").use_atom(&count);

    a.set(7);
    assert_eq!(a.get(), Some(7));
    assert_eq!(b.get(), Some(0));
    assert_eq!(store.read_atom_value("count", Some("B")), Some(json!(0)));
}

/// P8: an async default shared by two early consumers resolves once.
#[tokio::test]
async fn async_default_resolves_once() {
    let (tx, rx) = tokio::sync::oneshot::channel::<i32>();
    let rx = Arc::new(Mutex::new(Some(rx)));
    let calls = Arc::new(AtomicI32::new(0));

    let calls_clone = calls.clone();
    let answer = Atom::builder("answer")
        .default_async(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            let rx = rx.lock().take();
            async move {
                match rx {
                    Some(rx) => rx.await.unwrap_or(-1),
                    None => -1,
                }
            }
        })
        .build();

    let store = Store::new();
    let first = store.use_atom(&answer);
    let second = store.use_atom(&answer);
    assert_eq!(first.get(), None);
    assert_eq!(second.get(), None);

    tx.send(42).unwrap();
    store.settled().await;

    assert_eq!(first.get(), Some(42));
    assert_eq!(second.get(), Some(42));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Mounting later reuses the resolved value.
    let third = store.use_atom(&answer);
    assert_eq!(third.get(), Some(42));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// A write before the async default resolves keeps the written value.
#[tokio::test]
async fn writes_beat_a_late_async_default() {
    let (tx, rx) = tokio::sync::oneshot::channel::<i32>();
    let atom = Atom::builder("late")
        .default_future(async move { rx.await.unwrap_or(0) })
        .build();

    let store = Store::new();
    let handle = store.use_atom(&atom);
    handle.set(3);
    tx.send(100).unwrap();
    store.settled().await;

    assert_eq!(handle.get(), Some(3));
}

/// Filters waiting on an async default compute once it resolves.
#[tokio::test]
async fn filters_wait_for_async_defaults() {
    let base = Atom::builder("base").default_async(|| async { 21 }).build();
    let base_clone = base.clone();
    let doubled = Filter::builder("doubled")
        .default(0)
        .compute(move |get| Ok(get.get(&base_clone)? * 2));

    let store = Store::new();
    let view = store.use_filter(&doubled);
    assert_eq!(view.get(), Some(0));

    store.settled().await;
    assert_eq!(view.get(), Some(42));
}

/// Two tabs of one host: a write in one is synced into the other.
#[tokio::test]
async fn cross_tab_sync() {
    let host = HostStorage::new();
    let synced = Arc::new(Mutex::new(Vec::new()));

    let synced_clone = synced.clone();
    let theme = Atom::builder("theme")
        .default(String::from("light"))
        .sync(true)
        .on_sync(move |value: &String| synced_clone.lock().push(value.clone()))
        .build();

    let tab_one = Store::with_host(StoreConfig::default(), &host);
    let tab_two = Store::with_host(StoreConfig::default(), &host);
    let one = tab_one.use_atom(&theme);
    let two = tab_two.use_atom(&theme);
    tab_one.settled().await;
    tab_two.settled().await;

    one.set(String::from("dark"));
    assert_eq!(host.peek("theme").as_deref(), Some(r#""dark""#));
    assert_eq!(two.get().as_deref(), Some("dark"));
    assert_eq!(*synced.lock(), vec![String::from("dark")]);

    // And back the other way.
    two.set(String::from("dim"));
    assert_eq!(one.get().as_deref(), Some("dim"));
    assert_eq!(synced.lock().len(), 2);
}

/// Custom providers never receive cross-tab events.
#[tokio::test]
async fn sync_needs_the_host_provider() {
    let memory = MemoryStorage::new();
    let atom = Atom::builder("s").default(1).sync(true).build();
    let store = Store::with_storage(StoreConfig::default(), StorageProvider::sync(memory.clone()));

    let handle = store.use_atom(&atom);
    handle.set(2);
    store.settled().await;
    assert_eq!(memory.peek("s").as_deref(), Some("2"));
}

/// Effects: cleanup ordering, synchronous veto and the late-veto race.
#[tokio::test]
async fn effect_protocol() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let log_clone = log.clone();
    let atom = Atom::builder("guarded")
        .default(0)
        .effect(move |ctx| {
            let log = log_clone.clone();
            log.lock().push(format!("effect {}", ctx.state));
            if ctx.state < 0 {
                return Ok(EffectOutcome::Cancel);
            }
            let cleanup_log = log.clone();
            let state = ctx.state;
            Ok(EffectOutcome::cleanup(move || {
                cleanup_log.lock().push(format!("cleanup {}", state));
            }))
        })
        .build();

    let store = Store::new();
    let handle = store.use_atom(&atom);

    handle.set(1);
    assert_eq!(handle.set(-1), WriteOutcome::Cancelled);
    assert_eq!(handle.get(), Some(1));
    handle.set(2);

    assert_eq!(
        *log.lock(),
        vec!["effect 1", "cleanup 1", "effect -1", "effect 2"]
    );
}

#[tokio::test]
async fn deferred_vetoes_do_not_undo_commits() {
    let atom = Atom::builder("racy")
        .default(0)
        .effect(|_| {
            Ok(EffectOutcome::deferred(async {
                tokio::task::yield_now().await;
                DeferredOutcome::Cancel
            }))
        })
        .build();

    let store = Store::new();
    let handle = store.use_atom(&atom);

    assert_eq!(handle.set(5), WriteOutcome::Committed);
    store.settled().await;

    assert_eq!(handle.get(), Some(5));
    assert!(handle.needs_rerun());
    assert_eq!(store.root().late_vetoes(&atom), 1);
}

/// Actions are sugar over the writer and see the latest value.
#[test]
fn actions_dispatch_through_the_writer() {
    let todos = Atom::builder("todos")
        .default(Vec::<String>::new())
        .action("add", |ctx| {
            let mut next = ctx.state.unwrap_or_default();
            if let Some(text) = ctx.args.as_str() {
                next.push(text.to_string());
            }
            ctx.dispatch.set(next);
        })
        .action("clear", |ctx| {
            ctx.dispatch.set(Vec::new());
        })
        .build();

    let store = Store::new();
    let list = store.use_atom(&todos);
    let actions = list.actions();

    actions.call("add", json!("milk")).unwrap();
    actions.call("add", json!("eggs")).unwrap();
    assert_eq!(list.get(), Some(vec![String::from("milk"), String::from("eggs")]));

    actions.call("clear", json!(null)).unwrap();
    assert_eq!(list.get(), Some(Vec::new()));

    assert!(matches!(
        actions.call("nope", json!(null)),
        Err(StateError::UnknownAction { .. })
    ));
}

/// Filter compute failures fall back to the default and recover later.
#[test]
fn failing_filters_recover() {
    let store = Store::new();
    let divisor = Atom::new("divisor", 2);

    let d = divisor.clone();
    let quotient = Filter::builder("quotient").default(0).compute(move |get| {
        let divisor = get.get(&d)?;
        if divisor == 0 {
            return Err(StateError::custom("division by zero"));
        }
        Ok(100 / divisor)
    });

    let view = store.use_filter(&quotient);
    assert_eq!(view.get(), Some(50));

    store.root().writer(&divisor).set(0);
    assert_eq!(view.get(), Some(0));

    store.root().writer(&divisor).set(4);
    assert_eq!(view.get(), Some(25));
}

/// A filter reading itself falls back instead of overflowing the stack.
#[test]
fn self_reading_filter_falls_back() {
    let slot: Arc<Mutex<Option<Filter<i32>>>> = Arc::new(Mutex::new(None));
    let slot_clone = slot.clone();
    let looped = Filter::builder("looped").default(-1).compute(move |get| {
        let me = slot_clone.lock().clone();
        match me {
            Some(me) => Ok(get.read(&me)? + 1),
            None => Ok(0),
        }
    });
    *slot.lock() = Some(looped.clone());

    let store = Store::new();
    assert_eq!(store.use_filter(&looped).get(), Some(-1));
}

/// Seeded atoms and filters are used until something replaces them.
#[test]
fn seeding_before_mount() {
    let store = Store::new();
    let scope = store.scope("ssr");
    scope.seed_atom("user", String::from("ada"));
    scope.seed_filter("greeting", String::from("hello from the server"));

    let user = Atom::new("user", String::from("anonymous"));
    let user_clone = user.clone();
    let greeting = Filter::new("greeting", move |get| {
        Ok(format!("hello {}", get.get(&user_clone)?))
    });

    assert_eq!(scope.use_atom(&user).get().as_deref(), Some("ada"));
    let view = scope.use_filter(&greeting);
    assert_eq!(view.get().as_deref(), Some("hello from the server"));

    scope.writer(&user).set(String::from("grace"));
    assert_eq!(view.get().as_deref(), Some("hello grace"));
}

/// Snapshots dump one scope in JSON form.
#[test]
fn snapshot_of_a_scope() {
    let store = Store::new();
    let scope = store.scope("A");
    let count = Atom::new("count", 1);
    let c = count.clone();
    let double = Filter::new("double", move |get| Ok(get.get(&c)? * 2));

    scope.use_filter(&double);
    scope.writer(&count).set(4);

    let snapshot = store.snapshot(Some("A"));
    assert_eq!(snapshot.atoms.get("count"), Some(&json!(4)));
    assert_eq!(snapshot.filters.get("double"), Some(&json!(8)));
    assert!(store.snapshot(None).atoms.is_empty());
}

/// Configuration loaded from JSON shapes the store.
#[test]
fn store_from_json_config() {
    let config = StoreConfig::from_json(r#"{ "default_scope": "tab", "max_filter_depth": 2 }"#).unwrap();
    let store = Store::with_config(config);
    assert_eq!(store.root().name(), Some("tab"));

    let a = Atom::new("a", 1);
    let a1 = a.clone();
    let one = Filter::new("one", move |get| get.get(&a1));
    let o = one.clone();
    let two = Filter::new("two", move |get| get.read(&o));
    let t = two.clone();
    let three = Filter::builder("three").default(0).compute(move |get| get.read(&t));

    // three -> two -> one is deeper than the limit.
    assert_eq!(store.use_filter(&three).get(), Some(0));
    assert_eq!(store.read_filter_value("one", Some("tab")), None);

    let shallow = Store::new();
    assert_eq!(shallow.use_filter(&two).get(), Some(1));
    assert_eq!(shallow.read_atom_value("a", None), Some(json!(1)));
}

/// An effect that dispatches a nested write without cancelling: the outer
/// write still lands last, and every consumer ends on the canonical value.
#[test]
fn nested_effect_writes_keep_consumers_in_step() {
    let store = Store::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let log_clone = log.clone();
    let atom = Atom::builder("level")
        .default(2)
        .effect(move |ctx| {
            log_clone.lock().push(ctx.state);
            if ctx.previous == Some(ctx.state) {
                ctx.dispatch.set(ctx.state + 1);
            }
            Ok(EffectOutcome::Continue)
        })
        .build();

    let reader = store.use_atom(&atom);
    let writer = store.use_atom(&atom);

    assert_eq!(writer.set(2), WriteOutcome::Committed);
    assert_eq!(*log.lock(), vec![2, 3]);
    assert_eq!(store.root().atom_value(&atom), Some(2));
    assert_eq!(reader.get(), Some(2));
    assert_eq!(writer.get(), Some(2));
}

/// A consumer that writes from its render callback: the nested write wins
/// for everyone, including listeners the outer emission had not reached.
#[test]
fn listeners_may_write_during_fan_out() {
    let store = Store::new();
    let level = Atom::new("level", 0);

    let clamping = store.use_atom(&level);
    let writer = store.use_atom(&level);
    let reader = store.use_atom(&level);

    let clamp = clamping.writer();
    clamping.on_render(move |value| {
        if value.is_some_and(|v| *v > 10) {
            clamp.set(10);
        }
    });

    writer.set(50);
    assert_eq!(store.root().atom_value(&level), Some(10));
    assert_eq!(clamping.get(), Some(10));
    assert_eq!(writer.get(), Some(10));
    assert_eq!(reader.get(), Some(10));
}

/// P4 holds when a filter's consumer writes the filter's own dependency
/// while the filter is emitting.
#[test]
fn filter_consumers_may_write_dependencies() {
    let store = Store::new();
    let a = Atom::new("a", 1);
    let a_clone = a.clone();
    let doubled = Filter::new("f", move |get| Ok(get.get(&a_clone)? * 2));

    let view = store.use_filter(&doubled);
    let counter = store.use_atom(&a);
    let reset = store.root().writer(&a);
    view.on_render(move |value| {
        if value.is_some_and(|v| *v > 10) {
            reset.set(3);
        }
    });

    counter.set(50);
    assert_eq!(counter.get(), Some(3));
    assert_eq!(view.get(), Some(6));
    assert_eq!(store.read_filter_value("f", None), Some(json!(6)));
}
