//! Identity, change tracking and flush behaviour against the in-memory store.

mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{seeded_submissions, unwrap_outcome};
use relmap::prelude::*;
use relmap::Operation;

#[test]
fn test_identity_is_per_session() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (factory, _db) = seeded_submissions();

    rt.block_on(async {
        let mut first = factory.fork();
        let mut second = factory.fork();
        let options = FindOptions::new();

        let a = unwrap_outcome(first.find_by_key(&cx, "User", KeyTuple::single(1_i64), &options).await)
            .unwrap();
        let b = unwrap_outcome(first.find_all(&cx, "User", Condition::eq("id", 1_i64), &options).await);
        assert!(a.ptr_eq(&b[0]));

        let c = unwrap_outcome(second.find_by_key(&cx, "User", KeyTuple::single(1_i64), &options).await)
            .unwrap();
        assert!(!a.ptr_eq(&c));
        assert_ne!(first.id(), second.id());

        // Edits in one session are invisible to the other until flushed.
        a.set("email", "changed@example.com").unwrap();
        assert_eq!(c.get("email").unwrap(), Value::Text("user1@example.com".into()));
    });
}

#[test]
fn test_dirty_update_is_written_once() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (factory, db) = seeded_submissions();

    rt.block_on(async {
        let mut session = factory.fork();
        let user = unwrap_outcome(
            session
                .find_by_key(&cx, "User", KeyTuple::single(2_i64), &FindOptions::new())
                .await,
        )
        .unwrap();
        user.set("email", "two@example.com").unwrap();
        assert_eq!(session.state_of(&user), LifecycleState::ManagedDirty);

        let sets = session.compute_change_sets().unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].operation, Operation::Update);
        assert_eq!(sets[0].changes.len(), 1);
        assert_eq!(sets[0].changes[0].field, "email");

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.updated, 1);
        assert_eq!(session.state_of(&user), LifecycleState::ManagedClean);
        assert!(session.compute_change_sets().unwrap().is_empty());

        let stored = db
            .rows("User")
            .unwrap()
            .into_iter()
            .find(|r| r.get_by_name("id") == Some(&Value::BigInt(2)))
            .unwrap();
        assert_eq!(
            stored.get_by_name("email"),
            Some(&Value::Text("two@example.com".into()))
        );
    });
}

#[test]
fn test_generated_keys_propagate_to_children() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (factory, db) = seeded_submissions();

    rt.block_on(async {
        let mut session = factory.fork();
        let user = session
            .create("User", Fields::new().set("email", "new@example.com"))
            .unwrap();
        let submission = session
            .create(
                "Submission",
                Fields::new().set("title", "Hello").entity("user", &user),
            )
            .unwrap();
        assert!(!user.key().is_complete());
        assert_eq!(session.state_of(&submission), LifecycleState::New);

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.inserted, 2);
        assert_eq!(user.key(), KeyTuple::single(4_i64));
        assert_eq!(submission.column("user_id"), Some(Value::BigInt(4)));
        assert_eq!(submission.key(), KeyTuple::single(4_i64));
        assert_eq!(session.state_of(&user), LifecycleState::ManagedClean);
        assert_eq!(session.state_of(&submission), LifecycleState::ManagedClean);
        assert_eq!(db.row_count("Submission"), 4);

        let found = unwrap_outcome(
            session
                .find_by_key(&cx, "User", KeyTuple::single(4_i64), &FindOptions::new())
                .await,
        )
        .unwrap();
        assert!(found.ptr_eq(&user));
    });
}

#[test]
fn test_loaded_child_repointed_at_new_parent() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (factory, db) = seeded_submissions();

    rt.block_on(async {
        let mut session = factory.fork();
        let submission = unwrap_outcome(
            session
                .find_by_key(&cx, "Submission", KeyTuple::single(1_i64), &FindOptions::new())
                .await,
        )
        .unwrap();
        let user = session
            .create("User", Fields::new().set("email", "owner@example.com"))
            .unwrap();
        submission
            .set_reference("user", Some(&user.to_reference()))
            .unwrap();

        let sets = session.compute_change_sets().unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].operation, Operation::Insert);
        assert_eq!(sets[1].operation, Operation::Update);

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!((result.inserted, result.updated), (1, 1));
        assert_eq!(user.key(), KeyTuple::single(4_i64));
        assert_eq!(submission.column("user_id"), Some(Value::BigInt(4)));
        assert_eq!(session.state_of(&submission), LifecycleState::ManagedClean);
        assert!(session.compute_change_sets().unwrap().is_empty());

        let stored = db
            .rows("Submission")
            .unwrap()
            .into_iter()
            .find(|r| r.get_by_name("id") == Some(&Value::BigInt(1)))
            .unwrap();
        assert_eq!(stored.get_by_name("user_id"), Some(&Value::BigInt(4)));
    });
}

#[test]
fn test_count_leaves_out_removed_instances() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (factory, _db) = seeded_submissions();

    rt.block_on(async {
        let mut session = factory.fork();
        let users = unwrap_outcome(
            session
                .find_all(&cx, "User", Condition::True, &FindOptions::new())
                .await,
        );
        assert_eq!(users.len(), 2);
        session.remove(&users[0]).unwrap();

        let (found, total) = unwrap_outcome(
            session
                .find_and_count(&cx, "User", Condition::True, &FindOptions::new())
                .await,
        );
        assert_eq!((found.len(), total), (1, 1));

        let (page, total) = unwrap_outcome(
            session
                .find_and_count(
                    &cx,
                    "User",
                    Condition::True,
                    &FindOptions::new().order_by("id", Direction::Desc).limit(1),
                )
                .await,
        );
        assert_eq!(page.len(), 1);
        assert_eq!(total, 1);
        assert_eq!(page[0].key(), KeyTuple::single(2_i64));
    });
}

#[test]
fn test_failed_flush_leaves_state_for_retry() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (factory, db) = seeded_submissions();

    rt.block_on(async {
        let mut session = factory.fork();
        let duplicate = session
            .create("User", Fields::new().set("email", "user1@example.com"))
            .unwrap();
        let submission = session
            .create(
                "Submission",
                Fields::new().set("title", "Orphan").entity("user", &duplicate),
            )
            .unwrap();
        let planned = session.compute_change_sets().unwrap();

        let outcome = session.flush(&cx).await;
        assert!(matches!(outcome, Outcome::Err(Error::Write(_))));
        assert_eq!(session.state_of(&duplicate), LifecycleState::New);
        assert_eq!(session.state_of(&submission), LifecycleState::New);
        assert!(!duplicate.key().is_complete());
        assert_eq!(db.row_count("User"), 3);
        assert_eq!(db.row_count("Submission"), 3);
        assert_eq!(session.compute_change_sets().unwrap(), planned);

        duplicate.set("email", "unique@example.com").unwrap();
        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.inserted, 2);
        assert_eq!(db.row_count("User"), 4);
        assert_eq!(submission.column("user_id"), duplicate.column("id"));
    });
}

#[test]
fn test_missing_required_reference_fails_validation() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (factory, db) = seeded_submissions();

    rt.block_on(async {
        let mut session = factory.fork();
        session
            .create("Submission", Fields::new().set("title", "Nobody's"))
            .unwrap();
        match session.flush(&cx).await {
            Outcome::Err(Error::Validation(e)) => {
                assert_eq!(e.entity, "Submission");
                assert!(e.errors.iter().any(|f| f.field == "user_id"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(db.row_count("Submission"), 3);
    });
}

#[test]
fn test_mutual_new_references_are_cyclic() {
    let (factory, _db) = Orm::builder()
        .entity(
            EntityDescriptor::new("Left")
                .field(FieldDescriptor::scalar("id").primary_key())
                .field(
                    FieldDescriptor::reference("right", RelationshipKind::ManyToOne, "Right")
                        .join("right_id", "id")
                        .nullable(),
                ),
        )
        .entity(
            EntityDescriptor::new("Right")
                .field(FieldDescriptor::scalar("id").primary_key())
                .field(
                    FieldDescriptor::reference("left", RelationshipKind::ManyToOne, "Left")
                        .join("left_id", "id")
                        .nullable(),
                ),
        )
        .build_in_memory()
        .expect("build model");

    let mut session = factory.fork();
    let left = session.create("Left", Fields::new().set("id", 1_i64)).unwrap();
    let right = session
        .create("Right", Fields::new().set("id", 1_i64).entity("left", &left))
        .unwrap();
    left.set_reference("right", Some(&right.to_reference()))
        .unwrap();

    match session.compute_change_sets() {
        Err(Error::CyclicDependency { entities }) => {
            assert!(entities.iter().any(|e| e == "Left"));
            assert!(entities.iter().any(|e| e == "Right"));
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
}

#[test]
fn test_clear_detaches_and_close_refuses_work() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (factory, _db) = seeded_submissions();

    rt.block_on(async {
        let mut session = factory.fork();
        let user = unwrap_outcome(
            session
                .find_by_key(&cx, "User", KeyTuple::single(1_i64), &FindOptions::new())
                .await,
        )
        .unwrap();
        session.clear();
        assert_eq!(session.tracked_count(), 0);
        assert_eq!(session.state_of(&user), LifecycleState::Detached);
        assert!(matches!(
            user.set("email", "late@example.com"),
            Err(Error::DetachedEntity { .. })
        ));
        assert!(matches!(
            session.remove(&user),
            Err(Error::DetachedEntity { .. })
        ));

        let fresh = unwrap_outcome(
            session
                .find_by_key(&cx, "User", KeyTuple::single(1_i64), &FindOptions::new())
                .await,
        )
        .unwrap();
        assert!(!fresh.ptr_eq(&user));

        session.close();
        assert!(session.is_closed());
        assert_eq!(session.state_of(&fresh), LifecycleState::Detached);
        let refused = session
            .find_all(&cx, "User", Condition::True, &FindOptions::new())
            .await;
        assert!(matches!(refused, Outcome::Err(Error::DetachedEntity { .. })));
        assert!(matches!(session.flush(&cx).await, Outcome::Err(_)));
    });
}
