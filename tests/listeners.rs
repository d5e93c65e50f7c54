//! Integration tests for the wildcard listener engine: broadcast,
//! cardinality, two-phase delivery, and targeted replay.

use std::cell::RefCell;
use std::rc::Rc;

use tessera::{Datum, Store};

fn counter() -> (Rc<RefCell<usize>>, Rc<RefCell<usize>>) {
    let calls = Rc::new(RefCell::new(0));
    (Rc::clone(&calls), calls)
}

// --- Wildcard Broadcast ---

#[test]
fn test_wildcard_row_listener_fires_for_any_table() {
    let mut store = Store::new();
    let rows = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&rows);
    store.add_row_listener(
        None,
        None,
        move |_, t, r| seen.borrow_mut().push((t.to_owned(), r.to_owned())),
        false,
    );

    store.set_cell("pets", "fido", "species", "dog");
    store.set_cell("cars", "beetle", "wheels", 4);

    assert_eq!(
        *rows.borrow(),
        vec![
            ("pets".to_owned(), "fido".to_owned()),
            ("cars".to_owned(), "beetle".to_owned())
        ]
    );
}

#[test]
fn test_specific_table_wildcard_row_listener_is_scoped() {
    let mut store = Store::new();
    let rows = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&rows);
    store.add_row_listener(
        Some("pets"),
        None,
        move |_, _, r| seen.borrow_mut().push(r.to_owned()),
        false,
    );

    store.set_cell("pets", "fido", "species", "dog");
    store.set_cell("cars", "beetle", "wheels", 4);
    store.set_cell("pets", "rex", "species", "cat");

    assert_eq!(*rows.borrow(), vec!["fido".to_owned(), "rex".to_owned()]);
}

#[test]
fn test_cell_listener_path_and_payload() {
    let mut store = Store::new();
    let calls = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&calls);
    store.add_cell_listener(
        Some("pets"),
        None,
        Some("species"),
        move |_, t, r, c, new, old| {
            seen.borrow_mut()
                .push((t.to_owned(), r.to_owned(), c.to_owned(), new, old));
        },
        false,
    );

    store.set_cell("pets", "fido", "species", "dog");
    store.set_cell("pets", "fido", "legs", 4);
    store.set_cell("pets", "fido", "species", "wolf");

    let calls = calls.borrow();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[0],
        (
            "pets".to_owned(),
            "fido".to_owned(),
            "species".to_owned(),
            Some("dog".into()),
            None
        )
    );
    assert_eq!(
        calls[1],
        (
            "pets".to_owned(),
            "fido".to_owned(),
            "species".to_owned(),
            Some("wolf".into()),
            Some("dog".into())
        )
    );
}

#[test]
fn test_id_listeners_fire_on_membership_changes_only() {
    let mut store = Store::new();
    let (table_ids, table_seen) = counter();
    store.add_table_ids_listener(move |_| *table_seen.borrow_mut() += 1, false);
    let (row_ids, row_seen) = counter();
    store.add_row_ids_listener(Some("pets"), move |_, _| *row_seen.borrow_mut() += 1, false);

    store.set_cell("pets", "fido", "species", "dog");
    assert_eq!(*table_ids.borrow(), 1);
    assert_eq!(*row_ids.borrow(), 1);

    // Changing an existing cell shifts no ids.
    store.set_cell("pets", "fido", "species", "wolf");
    assert_eq!(*table_ids.borrow(), 1);
    assert_eq!(*row_ids.borrow(), 1);

    store.set_cell("pets", "rex", "species", "cat");
    assert_eq!(*table_ids.borrow(), 1);
    assert_eq!(*row_ids.borrow(), 2);
}

// --- Cardinality ---

#[test]
fn test_del_listener_stops_delivery() {
    let mut store = Store::new();
    let (calls, seen) = counter();
    let id = store.add_cell_listener(
        None,
        None,
        None,
        move |_, _, _, _, _, _| *seen.borrow_mut() += 1,
        false,
    );

    store.set_cell("pets", "fido", "species", "dog");
    assert_eq!(*calls.borrow(), 1);

    assert!(store.del_listener(id));
    store.set_cell("pets", "fido", "species", "wolf");
    assert_eq!(*calls.borrow(), 1);
    assert!(!store.del_listener(id));
}

#[test]
fn test_listener_fires_once_per_change_despite_wildcards() {
    let mut store = Store::new();
    let (calls, seen) = counter();
    // Registered once; reachable through the wildcard branch only.
    store.add_cell_listener(
        Some("pets"),
        None,
        None,
        move |_, _, _, _, _, _| *seen.borrow_mut() += 1,
        false,
    );

    store.set_cell("pets", "fido", "species", "dog");
    assert_eq!(*calls.borrow(), 1);
}

#[test]
fn test_listeners_fire_in_registration_order() {
    let mut store = Store::new();
    let order = Rc::new(RefCell::new(Vec::new()));

    let seen = Rc::clone(&order);
    store.add_cell_listener(
        Some("pets"),
        Some("fido"),
        Some("species"),
        move |_, _, _, _, _, _| seen.borrow_mut().push("exact"),
        false,
    );
    let seen = Rc::clone(&order);
    store.add_cell_listener(
        None,
        None,
        None,
        move |_, _, _, _, _, _| seen.borrow_mut().push("wild"),
        false,
    );

    store.set_cell("pets", "fido", "species", "dog");
    assert_eq!(*order.borrow(), vec!["exact", "wild"]);
}

// --- Two-Phase Delivery ---

#[test]
fn test_mutator_writes_fold_into_the_same_commit() {
    let mut store = Store::new();

    // A derived-view style mutator: keeps a per-table row count value.
    store.add_row_ids_listener(
        None,
        |s, t| {
            let count = s.get_row_count(t) as i64;
            let id = format!("{}_count", t);
            s.set_value(&id, count);
        },
        true,
    );

    let commits = Rc::new(RefCell::new(0));
    let seen = Rc::clone(&commits);
    store.add_did_finish_transaction_listener(move |_| *seen.borrow_mut() += 1);

    let values = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&values);
    store.add_value_listener(
        Some("pets_count"),
        move |_, _, new, _| seen.borrow_mut().push(new),
        false,
    );

    store.transaction(|s| {
        s.set_cell("pets", "fido", "species", "dog");
        s.set_cell("pets", "rex", "species", "cat");
    });

    // One commit; the derived value landed inside it with the final count.
    assert_eq!(*commits.borrow(), 1);
    assert_eq!(store.get_value("pets_count"), Some(2.into()));
    assert_eq!(*values.borrow(), vec![Some(2.into())]);
}

#[test]
fn test_immutable_phase_writes_are_ignored() {
    let mut store = Store::new();
    store.add_cell_listener(
        None,
        None,
        None,
        |s, _, _, _, _, _| {
            s.set_value("sneaky", true);
        },
        false,
    );

    store.set_cell("pets", "fido", "species", "dog");
    assert_eq!(store.get_value("sneaky"), None);
}

#[test]
fn test_mutator_listeners_run_before_immutable_listeners() {
    let mut store = Store::new();
    let order = Rc::new(RefCell::new(Vec::new()));

    let seen = Rc::clone(&order);
    store.add_cell_listener(
        None,
        None,
        None,
        move |_, _, _, _, _, _| seen.borrow_mut().push("immutable"),
        false,
    );
    let seen = Rc::clone(&order);
    store.add_cell_listener(
        None,
        None,
        None,
        move |_, _, _, _, _, _| seen.borrow_mut().push("mutator"),
        true,
    );

    store.set_cell("pets", "fido", "species", "dog");
    assert_eq!(*order.borrow(), vec!["mutator", "immutable"]);
}

#[test]
fn test_transaction_lifecycle_order() {
    let mut store = Store::new();
    let order = Rc::new(RefCell::new(Vec::new()));

    let seen = Rc::clone(&order);
    store.add_start_transaction_listener(move |_| seen.borrow_mut().push("start"));
    let seen = Rc::clone(&order);
    store.add_will_finish_transaction_listener(move |_| seen.borrow_mut().push("will"));
    let seen = Rc::clone(&order);
    store.add_did_finish_transaction_listener(move |_| seen.borrow_mut().push("did"));
    let seen = Rc::clone(&order);
    store.add_cell_listener(
        None,
        None,
        None,
        move |_, _, _, _, _, _| seen.borrow_mut().push("cell"),
        false,
    );

    store.set_cell("pets", "fido", "species", "dog");
    assert_eq!(*order.borrow(), vec!["start", "will", "cell", "did"]);
}

#[test]
fn test_invalid_listeners_fire_before_change_listeners() {
    let mut store = Store::new();
    let order = Rc::new(RefCell::new(Vec::new()));

    let seen = Rc::clone(&order);
    store.add_cell_listener(
        None,
        None,
        None,
        move |_, _, _, _, _, _| seen.borrow_mut().push("cell"),
        false,
    );
    let seen = Rc::clone(&order);
    store.add_invalid_cell_listener(
        None,
        None,
        None,
        move |_, _, _, _, _| seen.borrow_mut().push("invalid"),
        false,
    );

    store.transaction(|s| {
        s.set_cell("pets", "fido", "species", "dog");
        s.set_cell("pets", "fido", "weight", Datum::Number(f64::NAN));
    });
    assert_eq!(*order.borrow(), vec!["invalid", "cell"]);
}

#[test]
fn test_invalid_value_listener_receives_raw_input() {
    let mut store = Store::new();
    let raws = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&raws);
    store.add_invalid_value_listener(
        Some("ratio"),
        move |_, v, raw| seen.borrow_mut().push((v.to_owned(), raw.to_vec())),
        false,
    );

    store.set_value("ratio", Datum::Number(f64::NAN));
    store.set_value("other", Datum::Null);

    let raws = raws.borrow();
    assert_eq!(raws.len(), 1);
    assert_eq!(raws[0].0, "ratio");
    assert_eq!(raws[0].1, vec![serde_json::Value::Null]);
}

// --- Targeted Replay ---

#[test]
fn test_call_listener_expands_wildcards_against_current_ids() {
    let mut store = Store::new();
    store.set_cell("pets", "fido", "species", "dog");
    store.set_cell("pets", "rex", "species", "cat");
    store.set_cell("cars", "beetle", "wheels", 4);

    let calls = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&calls);
    let id = store.add_cell_listener(
        Some("pets"),
        None,
        Some("species"),
        move |_, t, r, c, new, old| {
            seen.borrow_mut()
                .push((t.to_owned(), r.to_owned(), c.to_owned(), new, old));
        },
        false,
    );

    // No change has happened yet; replay synthesizes the notifications.
    store.call_listener(id);
    assert_eq!(
        *calls.borrow(),
        vec![
            (
                "pets".to_owned(),
                "fido".to_owned(),
                "species".to_owned(),
                Some(Datum::Text("dog".into())),
                None
            ),
            (
                "pets".to_owned(),
                "rex".to_owned(),
                "species".to_owned(),
                Some(Datum::Text("cat".into())),
                None
            )
        ]
    );
}

#[test]
fn test_call_listener_skips_absent_paths() {
    let mut store = Store::new();
    let (calls, seen) = counter();
    let id = store.add_row_listener(
        Some("ghosts"),
        None,
        move |_, _, _| *seen.borrow_mut() += 1,
        false,
    );

    store.call_listener(id);
    assert_eq!(*calls.borrow(), 0);
}

#[test]
fn test_call_listener_on_zero_path_topics() {
    let mut store = Store::new();
    store.set_value("open", true);
    let (calls, seen) = counter();
    let id = store.add_values_listener(move |_| *seen.borrow_mut() += 1, false);

    store.call_listener(id);
    assert_eq!(*calls.borrow(), 1);
}

#[test]
fn test_listener_ids_are_pooled() {
    let mut store = Store::new();
    let a = store.add_tables_listener(|_| {}, false);
    store.del_listener(a);
    let b = store.add_tables_listener(|_| {}, false);
    assert_eq!(a, b);
    assert_eq!(store.listener_count(), 1);
}
