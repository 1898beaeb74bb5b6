//! Transaction lifecycle, isolation, savepoints, and spill behavior.

use arbordb_core::{
    doc, Config, CoreError, Database, Filter, Isolation, Mutation, Session, Value,
};

fn db_with_users() -> (Database, Session) {
    let db = Database::open_in_memory().unwrap();
    let mut session = Session::new();
    db.create_collection(&mut session, "users", Default::default())
        .unwrap();
    (db, session)
}

#[test]
fn insert_then_rollback_leaves_nothing() {
    let (db, mut session) = db_with_users();

    db.begin_transaction(&mut session, None).unwrap();
    db.insert(&mut session, "users", doc! { "_id" => 1_i64 })
        .unwrap();
    assert_eq!(db.count(&mut session, "users", &Filter::All).unwrap(), 1);
    db.rollback_transaction(&mut session).unwrap();

    assert_eq!(db.count(&mut session, "users", &Filter::All).unwrap(), 0);
    let stats = db.stats("users").unwrap();
    assert_eq!(stats.count, 0);
    assert_eq!(stats.data_size, 0);
}

#[test]
fn commit_publishes_atomically() {
    let (db, mut session) = db_with_users();

    db.begin_transaction(&mut session, None).unwrap();
    for i in 0..5_i64 {
        db.insert(&mut session, "users", doc! { "_id" => i })
            .unwrap();
    }
    // A second session sees nothing until commit.
    let mut other = Session::new();
    assert_eq!(db.count(&mut other, "users", &Filter::All).unwrap(), 0);

    db.commit_transaction(&mut session).unwrap();
    assert_eq!(db.count(&mut other, "users", &Filter::All).unwrap(), 5);
}

#[test]
fn uncommitted_writes_invisible_to_default_isolation() {
    let (db, mut writer) = db_with_users();
    let mut reader = Session::new();

    db.begin_transaction(&mut writer, None).unwrap();
    db.insert(&mut writer, "users", doc! { "_id" => 1_i64 })
        .unwrap();

    assert_eq!(db.count(&mut reader, "users", &Filter::All).unwrap(), 0);
    assert!(db
        .find_all(&mut reader, "users", Filter::All, None)
        .unwrap()
        .is_empty());
    db.rollback_transaction(&mut writer).unwrap();
}

#[test]
fn read_uncommitted_observes_other_writers() {
    let (db, mut writer) = db_with_users();

    db.begin_transaction(&mut writer, None).unwrap();
    db.insert(&mut writer, "users", doc! { "_id" => 1_i64, "dirty" => true })
        .unwrap();

    let mut reader = Session::new();
    db.begin_transaction(&mut reader, Some(Isolation::ReadUncommitted))
        .unwrap();
    let seen = db
        .find_all(&mut reader, "users", Filter::All, None)
        .unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].get("dirty"), Some(&Value::Bool(true)));

    db.rollback_transaction(&mut reader).unwrap();
    db.rollback_transaction(&mut writer).unwrap();
}

#[test]
fn snapshot_reader_keeps_its_view() {
    let (db, mut writer) = db_with_users();
    db.insert(&mut writer, "users", doc! { "_id" => 1_i64, "v" => 1_i64 })
        .unwrap();

    let mut reader = Session::new();
    db.begin_transaction(&mut reader, Some(Isolation::Snapshot))
        .unwrap();
    // Touch the snapshot before the concurrent update.
    assert_eq!(db.count(&mut reader, "users", &Filter::All).unwrap(), 1);

    db.update(
        &mut writer,
        "users",
        &Filter::Eq("_id".into(), Value::Int(1)),
        &Mutation::Set(vec![("v".into(), Value::Int(2))]),
        false,
    )
    .unwrap();

    let seen = db
        .find_all(&mut reader, "users", Filter::All, None)
        .unwrap();
    assert_eq!(seen[0].get("v"), Some(&Value::Int(1)));
    db.rollback_transaction(&mut reader).unwrap();

    // A fresh read sees the update.
    let fresh = db
        .find_all(&mut writer, "users", Filter::All, None)
        .unwrap();
    assert_eq!(fresh[0].get("v"), Some(&Value::Int(2)));
}

#[test]
fn nested_rollback_preserves_parent_writes() {
    let (db, mut session) = db_with_users();

    db.begin_transaction(&mut session, None).unwrap();
    db.insert(&mut session, "users", doc! { "_id" => 1_i64 })
        .unwrap();

    // Nested level: its writes disappear on nested rollback only.
    db.begin_transaction(&mut session, None).unwrap();
    db.insert(&mut session, "users", doc! { "_id" => 2_i64 })
        .unwrap();
    assert_eq!(db.count(&mut session, "users", &Filter::All).unwrap(), 2);
    db.rollback_transaction(&mut session).unwrap();

    assert_eq!(db.count(&mut session, "users", &Filter::All).unwrap(), 1);
    db.commit_transaction(&mut session).unwrap();

    let committed = db
        .find_all(&mut session, "users", Filter::All, None)
        .unwrap();
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].get("_id"), Some(&Value::Int(1)));
}

#[test]
fn nested_commit_folds_into_parent() {
    let (db, mut session) = db_with_users();

    db.begin_transaction(&mut session, None).unwrap();
    db.begin_transaction(&mut session, None).unwrap();
    db.insert(&mut session, "users", doc! { "_id" => 7_i64 })
        .unwrap();
    db.commit_transaction(&mut session).unwrap(); // nested
    assert!(session.in_transaction());

    // Parent rollback still undoes the nested level's writes.
    db.rollback_transaction(&mut session).unwrap();
    assert_eq!(db.count(&mut session, "users", &Filter::All).unwrap(), 0);
}

#[test]
fn failed_operation_leaves_transaction_usable() {
    let (db, mut session) = db_with_users();

    db.begin_transaction(&mut session, None).unwrap();
    db.insert(&mut session, "users", doc! { "_id" => 1_i64 })
        .unwrap();
    // Duplicate fails, but the transaction keeps going.
    let err = db
        .insert(&mut session, "users", doc! { "_id" => 1_i64 })
        .unwrap_err();
    assert!(matches!(err, CoreError::DuplicateKey { .. }));
    assert!(session.in_transaction());

    db.insert(&mut session, "users", doc! { "_id" => 2_i64 })
        .unwrap();
    db.commit_transaction(&mut session).unwrap();
    assert_eq!(db.count(&mut session, "users", &Filter::All).unwrap(), 2);
}

#[test]
fn operations_after_commit_need_a_new_transaction() {
    let (db, mut session) = db_with_users();
    db.begin_transaction(&mut session, None).unwrap();
    db.commit_transaction(&mut session).unwrap();
    assert!(!session.in_transaction());
    // Auto-commit still works afterwards.
    db.insert(&mut session, "users", doc! { "_id" => 1_i64 })
        .unwrap();
    assert_eq!(db.count(&mut session, "users", &Filter::All).unwrap(), 1);
}

#[test]
fn commit_without_transaction_is_an_error() {
    let (db, mut session) = db_with_users();
    assert!(db.commit_transaction(&mut session).is_err());
    assert!(db.rollback_transaction(&mut session).is_err());
}

#[test]
fn session_records_last_write_outcome() {
    let (db, mut session) = db_with_users();

    db.insert(&mut session, "users", doc! { "_id" => 1_i64 })
        .unwrap();
    let ok = session.last_result().unwrap();
    assert!(ok.ok());
    assert_eq!(ok.inserted, 1);

    let _ = db.insert(&mut session, "users", doc! { "_id" => 1_i64 });
    let failed = session.last_result().unwrap();
    assert!(!failed.ok());
    assert!(failed.error.as_ref().unwrap().contains("duplicate key"));

    db.insert(&mut session, "users", doc! { "_id" => 2_i64 })
        .unwrap();
    db.remove(
        &mut session,
        "users",
        &Filter::Eq("_id".into(), Value::Int(2)),
        true,
    )
    .unwrap();
    assert_eq!(session.last_result().unwrap().removed, 1);
}

#[test]
fn first_committer_wins_under_snapshot_isolation() {
    let (db, mut setup) = db_with_users();
    db.insert(&mut setup, "users", doc! { "_id" => 1_i64, "v" => 0_i64 })
        .unwrap();

    let mut s1 = Session::new();
    let mut s2 = Session::new();
    db.begin_transaction(&mut s1, Some(Isolation::Snapshot))
        .unwrap();
    db.begin_transaction(&mut s2, Some(Isolation::Snapshot))
        .unwrap();

    let bump = |v| Mutation::Set(vec![("v".into(), Value::Int(v))]);
    let on_one = Filter::Eq("_id".into(), Value::Int(1));

    // The younger transaction writes and commits first; the older one
    // then writes against a snapshot that predates that commit.
    db.update(&mut s2, "users", &on_one, &bump(2), false).unwrap();
    db.commit_transaction(&mut s2).unwrap();

    db.update(&mut s1, "users", &on_one, &bump(1), false).unwrap();
    let err = db.commit_transaction(&mut s1).unwrap_err();
    assert!(matches!(err, CoreError::Conflict { .. }));

    let winner = db
        .find_all(&mut setup, "users", Filter::All, None)
        .unwrap();
    assert_eq!(winner[0].get("v"), Some(&Value::Int(2)));
}

#[test]
fn serializable_range_blocks_younger_phantom_insert() {
    let (db, mut reader) = db_with_users();
    let mut writer = Session::new();

    db.begin_transaction(&mut reader, Some(Isolation::Serializable))
        .unwrap();
    // The scan locks the range it read, gap included.
    let _ = db
        .find_all(&mut reader, "users", Filter::All, None)
        .unwrap();

    // The younger writer dies instead of creating a phantom.
    let err = db
        .insert(&mut writer, "users", doc! { "_id" => 1_i64 })
        .unwrap_err();
    assert!(matches!(err, CoreError::LockConflict { .. }));

    db.commit_transaction(&mut reader).unwrap();
    // The writer's session survives its aborted operation.
    db.insert(&mut writer, "users", doc! { "_id" => 1_i64 })
        .unwrap();
}

#[test]
fn lock_conflict_aborts_transaction_but_not_session() {
    let (db, mut holder) = db_with_users();
    db.insert(&mut holder, "users", doc! { "_id" => 1_i64 })
        .unwrap();

    db.begin_transaction(&mut holder, None).unwrap();
    db.update(
        &mut holder,
        "users",
        &Filter::Eq("_id".into(), Value::Int(1)),
        &Mutation::Set(vec![("v".into(), Value::Int(1))]),
        false,
    )
    .unwrap();

    // The younger victim's whole transaction aborts.
    let mut victim = Session::new();
    db.begin_transaction(&mut victim, None).unwrap();
    let err = db
        .update(
            &mut victim,
            "users",
            &Filter::Eq("_id".into(), Value::Int(1)),
            &Mutation::Set(vec![("v".into(), Value::Int(2))]),
            false,
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::LockConflict { .. }));
    assert!(!victim.in_transaction());

    db.commit_transaction(&mut holder).unwrap();
    // The victim's session keeps working.
    assert_eq!(db.count(&mut victim, "users", &Filter::All).unwrap(), 1);
}

#[test]
fn spilled_transaction_commits_identically() {
    // One database spills after a few hundred bytes, the other never
    // does; results must match exactly.
    let spilling = Database::open_in_memory_with_config(Config::new().txn_mem_limit(512)).unwrap();
    let roomy = Database::open_in_memory().unwrap();

    for db in [&spilling, &roomy] {
        let mut session = Session::new();
        db.create_collection(&mut session, "bulk", Default::default())
            .unwrap();
        db.begin_transaction(&mut session, None).unwrap();
        for i in 0..300_i64 {
            db.insert(
                &mut session,
                "bulk",
                doc! { "_id" => i, "payload" => "x".repeat(64) },
            )
            .unwrap();
        }
        // Rewrite some rows and delete others inside the same transaction.
        db.update(
            &mut session,
            "bulk",
            &Filter::Lt("_id".into(), Value::Int(10)),
            &Mutation::Set(vec![("flag".into(), Value::Bool(true))]),
            true,
        )
        .unwrap();
        db.remove(
            &mut session,
            "bulk",
            &Filter::Gte("_id".into(), Value::Int(290)),
            false,
        )
        .unwrap();
        db.commit_transaction(&mut session).unwrap();
    }

    assert!(spilling.engine_stats().txn_spills > 0);
    assert_eq!(roomy.engine_stats().txn_spills, 0);

    let mut s1 = Session::new();
    let mut s2 = Session::new();
    let a = spilling.find_all(&mut s1, "bulk", Filter::All, None).unwrap();
    let b = roomy.find_all(&mut s2, "bulk", Filter::All, None).unwrap();
    assert_eq!(a.len(), 290);
    assert_eq!(a, b);

    let flagged = Filter::Eq("flag".into(), Value::Bool(true));
    assert_eq!(
        spilling.count(&mut s1, "bulk", &flagged).unwrap(),
        roomy.count(&mut s2, "bulk", &flagged).unwrap()
    );
}

#[test]
fn spilled_transaction_rolls_back_cleanly() {
    let db = Database::open_in_memory_with_config(Config::new().txn_mem_limit(256)).unwrap();
    let mut session = Session::new();
    db.create_collection(&mut session, "bulk", Default::default())
        .unwrap();

    db.begin_transaction(&mut session, None).unwrap();
    for i in 0..200_i64 {
        db.insert(
            &mut session,
            "bulk",
            doc! { "_id" => i, "payload" => "y".repeat(32) },
        )
        .unwrap();
    }
    // Reads inside the transaction consult the spilled tier.
    assert_eq!(db.count(&mut session, "bulk", &Filter::All).unwrap(), 200);
    db.rollback_transaction(&mut session).unwrap();

    assert_eq!(db.count(&mut session, "bulk", &Filter::All).unwrap(), 0);
    assert_eq!(db.stats("bulk").unwrap().count, 0);
}
