//! Composite primary keys inherited from an abstract base, and a foreign key
//! that shares a column with the owner's primary key.

mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{seeded_org, unwrap_outcome};
use relmap::Operation;
use relmap::prelude::*;

#[test]
fn test_find_book_by_org_and_populate_author() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (factory, _db) = seeded_org();

    rt.block_on(async {
        let mut session = factory.fork();
        let book = unwrap_outcome(
            session
                .find_one_or_fail(
                    &cx,
                    "Book",
                    Condition::field_eq("org", 1_i64).and(Condition::eq("id", 1_i64)),
                    &FindOptions::new().populate("author"),
                )
                .await,
        );
        assert_eq!(book.key(), KeyTuple::from((1_i64, 1_i64)));

        let author = book
            .reference("author")
            .unwrap()
            .expect("book has an author");
        assert!(author.is_loaded());
        assert_eq!(author.key(), KeyTuple::from((1_i64, 1_i64)));
        let author = author.get().unwrap();
        assert_eq!(author.get("name").unwrap(), Value::Text("Alice".into()));

        // Loading does not make anything dirty.
        assert!(session.compute_change_sets().unwrap().is_empty());
        assert_eq!(session.state_of(&book), LifecycleState::ManagedClean);
    });
}

#[test]
fn test_reassigning_org_moves_shared_author_key() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (factory, _db) = seeded_org();

    rt.block_on(async {
        let mut session = factory.fork();
        let book = unwrap_outcome(
            session
                .find_by_key(
                    &cx,
                    "Book",
                    KeyTuple::from((1_i64, 1_i64)),
                    &FindOptions::new().populate("author"),
                )
                .await,
        )
        .expect("book 1 exists");
        assert!(book.reference("author").unwrap().unwrap().is_loaded());

        let org_b = session.reference_to("Organisation", 2_i64).unwrap();
        book.set_reference("org", Some(&org_b)).unwrap();

        // The author's key is read from the live columns, so the shared
        // org_id column carries it to (2, 1) and the stale payload is dropped.
        let author = book.reference("author").unwrap().unwrap();
        assert_eq!(author.key(), KeyTuple::from((2_i64, 1_i64)));
        assert!(!author.is_loaded());
        assert_eq!(book.column("org_id"), Some(Value::BigInt(2)));
        assert_eq!(session.state_of(&book), LifecycleState::ManagedDirty);
    });
}

#[test]
fn test_inverse_side_populates_from_owner() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (factory, _db) = seeded_org();

    rt.block_on(async {
        let mut session = factory.fork();
        let author = unwrap_outcome(
            session
                .find_by_key(&cx, "Author", KeyTuple::from((1_i64, 1_i64)), &FindOptions::new())
                .await,
        )
        .expect("author 1 exists");
        let book = unwrap_outcome(session.related(&cx, &author, "book").await)
            .expect("author wrote a book");
        assert_eq!(book.get("name").unwrap(), Value::Text("First Book".into()));

        let again = unwrap_outcome(
            session
                .find_by_key(&cx, "Book", KeyTuple::from((1_i64, 1_i64)), &FindOptions::new())
                .await,
        )
        .unwrap();
        assert!(again.ptr_eq(&book));
    });
}

#[test]
fn test_failed_create_leaves_no_identity_behind() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (factory, _db) = seeded_org();

    rt.block_on(async {
        let mut session = factory.fork();
        let org = Reference::unloaded("Organisation", 1_i64);
        let outcome = session.create(
            "Author",
            Fields::new()
                .reference("org", org.clone())
                .set("id", 9_i64)
                .set("name", "Bob")
                .reference("book", Reference::unloaded("Book", (1_i64, 1_i64))),
        );
        assert!(matches!(outcome, Err(Error::Relationship(_))));
        assert_eq!(session.tracked_count(), 0);
        assert!(session.identity_map().is_empty());

        let found = unwrap_outcome(
            session
                .find_by_key(&cx, "Author", KeyTuple::from((1_i64, 9_i64)), &FindOptions::new())
                .await,
        );
        assert!(found.is_none());

        let author = session
            .create(
                "Author",
                Fields::new().reference("org", org).set("id", 9_i64).set("name", "Bob"),
            )
            .unwrap();
        assert_eq!(author.key(), KeyTuple::from((1_i64, 9_i64)));
        assert_eq!(session.tracked_count(), 1);
    });
}

#[test]
fn test_abstract_base_cannot_be_queried() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (factory, _db) = seeded_org();

    rt.block_on(async {
        let mut session = factory.fork();
        let outcome = session
            .find_all(&cx, "OrgEntity", Condition::True, &FindOptions::new())
            .await;
        assert!(matches!(outcome, Outcome::Err(Error::Metadata(_))));
        assert!(matches!(
            session.create("OrgEntity", Fields::new()),
            Err(Error::Metadata(_))
        ));
    });
}

#[test]
fn test_insert_order_and_round_trip() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (factory, db) = seeded_org();

    rt.block_on(async {
        let mut session = factory.fork();
        let org = session
            .create(
                "Organisation",
                Fields::new().set("id", 10_i64).set("name", "Org C"),
            )
            .unwrap();
        let author = session
            .create(
                "Author",
                Fields::new()
                    .entity("org", &org)
                    .set("id", 1_i64)
                    .set("name", "Bea"),
            )
            .unwrap();
        let book = session
            .create(
                "Book",
                Fields::new()
                    .entity("org", &org)
                    .set("id", 1_i64)
                    .set("name", "Second Book")
                    .entity("author", &author),
            )
            .unwrap();
        assert_eq!(book.column("author_id"), Some(Value::BigInt(1)));

        let order: Vec<(String, Operation)> = session
            .compute_change_sets()
            .unwrap()
            .into_iter()
            .map(|cs| (cs.entity, cs.operation))
            .collect();
        assert_eq!(
            order,
            vec![
                ("Organisation".to_string(), Operation::Insert),
                ("Author".to_string(), Operation::Insert),
                ("Book".to_string(), Operation::Insert),
            ]
        );

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.inserted, 3);
        assert_eq!(db.row_count("Book"), 2);
        assert_eq!(session.state_of(&book), LifecycleState::ManagedClean);

        session.clear();
        assert_eq!(session.state_of(&book), LifecycleState::Detached);

        let reloaded = unwrap_outcome(
            session
                .find_by_key(
                    &cx,
                    "Book",
                    KeyTuple::from((10_i64, 1_i64)),
                    &FindOptions::new().populate("author"),
                )
                .await,
        )
        .expect("book was persisted");
        assert!(!reloaded.ptr_eq(&book));
        let author = reloaded.reference("author").unwrap().unwrap().get().unwrap();
        assert_eq!(author.get("name").unwrap(), Value::Text("Bea".into()));
    });
}

#[test]
fn test_cascade_remove_deletes_dependents_first() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (factory, db) = seeded_org();

    rt.block_on(async {
        let mut session = factory.fork();
        let books = unwrap_outcome(
            session
                .find_all(&cx, "Book", Condition::True, &FindOptions::new().populate("author"))
                .await,
        );
        assert_eq!(books.len(), 1);
        let org_ref = session.reference_to("Organisation", 1_i64).unwrap();
        let org = unwrap_outcome(session.load(&cx, &org_ref).await);

        session.remove(&org).unwrap();
        assert_eq!(session.state_of(&org), LifecycleState::Removed);
        assert_eq!(session.state_of(&books[0]), LifecycleState::Removed);

        let order: Vec<(String, Operation)> = session
            .compute_change_sets()
            .unwrap()
            .into_iter()
            .map(|cs| (cs.entity, cs.operation))
            .collect();
        assert_eq!(
            order,
            vec![
                ("Book".to_string(), Operation::Delete),
                ("Author".to_string(), Operation::Delete),
                ("Organisation".to_string(), Operation::Delete),
            ]
        );

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.deleted, 3);
        assert_eq!(db.row_count("Book"), 0);
        assert_eq!(db.row_count("Author"), 0);
        assert_eq!(db.row_count("Organisation"), 1);
        assert_eq!(session.state_of(&org), LifecycleState::Detached);

        let gone = unwrap_outcome(
            session
                .find_by_key(&cx, "Organisation", KeyTuple::single(1_i64), &FindOptions::new())
                .await,
        );
        assert!(gone.is_none());
    });
}
