use replica::{ActorId, ApplyOutcome, LocalEdit, Operation, ReplicatedDocument};

fn actor(n: u128) -> ActorId {
    ActorId(uuid::Uuid::from_u128(n))
}

/// Replica that has applied `base`
fn replica_from(n: u128, base: &[Operation]) -> ReplicatedDocument {
    let mut doc = ReplicatedDocument::new("src/main.rs", actor(n));
    let report = doc.merge(base.iter().cloned());
    assert!(report.is_clean());
    doc
}

/// Every permutation of `ops`, applied to a fresh copy of `base`
fn all_orders(base: &[Operation], ops: &[Operation]) -> Vec<String> {
    fn permute(items: &mut Vec<Operation>, k: usize, out: &mut Vec<Vec<Operation>>) {
        if k == items.len() {
            out.push(items.clone());
            return;
        }
        for i in k..items.len() {
            items.swap(k, i);
            permute(items, k + 1, out);
            items.swap(k, i);
        }
    }

    let mut orders = Vec::new();
    permute(&mut ops.to_vec(), 0, &mut orders);
    orders
        .into_iter()
        .map(|order| {
            let mut doc = replica_from(99, base);
            doc.merge(order);
            doc.text()
        })
        .collect()
}

#[test]
fn convergence_under_every_arrival_order() {
    let mut a = ReplicatedDocument::new("src/main.rs", actor(1));
    let base = a
        .create_local_operation(LocalEdit::insert(0, "let total = 0;\n"))
        .unwrap();

    let mut b = replica_from(2, &[base.clone()]);
    let mut c = replica_from(3, &[base.clone()]);

    let a1 = a.create_local_operation(LocalEdit::insert(4, "mut ")).unwrap();
    let a2 = a.create_local_operation(LocalEdit::delete(0, 3)).unwrap();
    let b1 = b.create_local_operation(LocalEdit::insert(4, "total")).unwrap();
    let c1 = c.create_local_operation(LocalEdit::delete(12, 1)).unwrap();
    let c2 = c.create_local_operation(LocalEdit::insert(12, "42")).unwrap();

    let texts = all_orders(&[base], &[a1, a2, b1, c1, c2]);
    assert!(texts.windows(2).all(|w| w[0] == w[1]), "{:?}", texts);
}

#[test]
fn idempotent_reapplication() {
    let mut a = ReplicatedDocument::new("f.txt", actor(1));
    let op1 = a.create_local_operation(LocalEdit::insert(0, "abc")).unwrap();
    let op2 = a.create_local_operation(LocalEdit::delete(1, 1)).unwrap();

    let mut once = replica_from(2, &[op1.clone(), op2.clone()]);
    let before = once.snapshot().unwrap();

    assert_eq!(once.apply_operation(op2.clone()).unwrap(), ApplyOutcome::Duplicate);
    once.merge(vec![op1, op2]);

    assert_eq!(once.text(), "ac");
    assert_eq!(once.snapshot().unwrap(), before);
}

#[test]
fn causal_safety_holds_until_dependencies_arrive() {
    let mut a = ReplicatedDocument::new("f.txt", actor(1));
    let op1 = a.create_local_operation(LocalEdit::insert(0, "first")).unwrap();
    let op2 = a.create_local_operation(LocalEdit::insert(5, " second")).unwrap();
    let op3 = a.create_local_operation(LocalEdit::insert(12, " third")).unwrap();

    let mut b = ReplicatedDocument::new("f.txt", actor(2));
    b.apply_operation(op3).unwrap();
    b.apply_operation(op2).unwrap();
    assert_eq!(b.text(), "");
    assert_eq!(b.pending_len(), 2);

    b.apply_operation(op1).unwrap();
    assert_eq!(b.text(), "first second third");
    assert_eq!(b.frontier(), a.frontier());
}

#[test]
fn non_overlapping_edits_are_both_kept() {
    let mut a = ReplicatedDocument::new("f.txt", actor(1));
    let base = a
        .create_local_operation(LocalEdit::insert(0, "alpha beta gamma"))
        .unwrap();
    let mut b = replica_from(2, &[base]);

    let from_a = a.create_local_operation(LocalEdit::insert(0, ">> ")).unwrap();
    let from_b = b.create_local_operation(LocalEdit::delete(6, 5)).unwrap();

    a.apply_operation(from_b).unwrap();
    b.apply_operation(from_a).unwrap();

    assert_eq!(a.text(), ">> alpha gamma");
    assert_eq!(a.text(), b.text());
}

#[test]
fn offline_insert_and_delete_converge() {
    let mut a = ReplicatedDocument::new("calc.py", actor(1));
    let base = a
        .create_local_operation(LocalEdit::insert(0, "0123456789abcdef"))
        .unwrap();
    let mut b = replica_from(2, &[base]);

    let a_frontier = a.frontier().clone();
    let b_frontier = b.frontier().clone();

    a.create_local_operation(LocalEdit::insert(10, "x=1")).unwrap();
    b.create_local_operation(LocalEdit::delete(5, 3)).unwrap();

    // Reconnect: each side answers the other's sync request
    let for_b = a.missing_for(&b_frontier);
    let for_a = b.missing_for(&a_frontier);
    assert_eq!(for_b.len(), 1);
    assert_eq!(for_a.len(), 1);

    assert!(a.merge(for_a).is_clean());
    assert!(b.merge(for_b).is_clean());

    assert_eq!(a.text(), "0123489x=1abcdef");
    assert_eq!(a.text(), b.text());
}

#[test]
fn restore_then_continue_syncing() {
    let mut a = ReplicatedDocument::new("f.txt", actor(1));
    a.create_local_operation(LocalEdit::insert(0, "snapshot")).unwrap();

    let mut b = ReplicatedDocument::restore(&a.snapshot().unwrap(), actor(2)).unwrap();
    let follow_up = a.create_local_operation(LocalEdit::insert(8, "!")).unwrap();

    assert!(matches!(
        b.apply_operation(follow_up).unwrap(),
        ApplyOutcome::Applied { .. }
    ));
    assert_eq!(b.text(), "snapshot!");
}
