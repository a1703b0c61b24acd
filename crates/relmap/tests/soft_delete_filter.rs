//! The default-on soft-delete filter, including its effect on populate.

mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{seeded_submissions, unwrap_outcome};
use relmap::prelude::*;

#[test]
fn test_populate_hides_submissions_of_deleted_users() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (factory, _db) = seeded_submissions();

    rt.block_on(async {
        let mut session = factory.fork();
        let (all, total) = unwrap_outcome(
            session
                .find_and_count(&cx, "Submission", Condition::True, &FindOptions::new())
                .await,
        );
        assert_eq!((all.len(), total), (3, 3));

        let mut session = factory.fork();
        let (visible, total) = unwrap_outcome(
            session
                .find_and_count(
                    &cx,
                    "Submission",
                    Condition::True,
                    &FindOptions::new().populate("user"),
                )
                .await,
        );
        assert_eq!((visible.len(), total), (2, 2));
        for submission in &visible {
            let user = submission.reference("user").unwrap().unwrap();
            assert!(user.is_loaded());
            assert_eq!(user.get().unwrap().get("deleted_at").unwrap(), Value::Null);
        }
    });
}

#[test]
fn test_related_to_deleted_user_resolves_to_none() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (factory, _db) = seeded_submissions();

    rt.block_on(async {
        let mut session = factory.fork();
        let third = unwrap_outcome(
            session
                .find_by_key(&cx, "Submission", KeyTuple::single(3_i64), &FindOptions::new())
                .await,
        )
        .expect("submission 3 exists");

        let user = unwrap_outcome(session.related(&cx, &third, "user").await);
        assert!(user.is_none());
        // The reference itself still carries the stored key.
        let reference = third.reference("user").unwrap().unwrap();
        assert_eq!(reference.key(), KeyTuple::single(3_i64));
        assert!(!reference.is_loaded());

        let load = session.load(&cx, &reference).await;
        assert!(matches!(load, Outcome::Err(Error::EntityNotFound { .. })));
    });
}

#[test]
fn test_filter_toggles_per_call_and_per_session() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (factory, _db) = seeded_submissions();

    rt.block_on(async {
        let mut session = factory.fork();
        let live = unwrap_outcome(
            session
                .find_all(&cx, "User", Condition::True, &FindOptions::new())
                .await,
        );
        assert_eq!(live.len(), 2);

        let everyone = unwrap_outcome(
            session
                .find_all(
                    &cx,
                    "User",
                    Condition::True,
                    &FindOptions::new().disable_filter("softDelete"),
                )
                .await,
        );
        assert_eq!(everyone.len(), 3);
        // The per-call toggle does not stick.
        assert!(session.active_filters().contains("softDelete"));

        session.disable_filter("softDelete").unwrap();
        assert!(session.active_filters().is_empty());
        let (subs, total) = unwrap_outcome(
            session
                .find_and_count(
                    &cx,
                    "Submission",
                    Condition::True,
                    &FindOptions::new().populate("user"),
                )
                .await,
        );
        assert_eq!((subs.len(), total), (3, 3));

        let filtered = unwrap_outcome(
            session
                .find_all(
                    &cx,
                    "User",
                    Condition::True,
                    &FindOptions::new().enable_filter("softDelete"),
                )
                .await,
        );
        assert_eq!(filtered.len(), 2);

        assert!(matches!(
            session.enable_filter("noSuchFilter"),
            Err(Error::Filter(_))
        ));
    });
}

#[test]
fn test_deleted_user_found_by_key_only_without_filter() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (factory, _db) = seeded_submissions();

    rt.block_on(async {
        let mut session = factory.fork();
        let hidden = unwrap_outcome(
            session
                .find_by_key(&cx, "User", KeyTuple::single(3_i64), &FindOptions::new())
                .await,
        );
        assert!(hidden.is_none());

        let found = unwrap_outcome(
            session
                .find_by_key(
                    &cx,
                    "User",
                    KeyTuple::single(3_i64),
                    &FindOptions::new().disable_filter("softDelete"),
                )
                .await,
        )
        .expect("visible without the filter");

        // Once tracked, the identity map answers without consulting filters.
        let cached = unwrap_outcome(
            session
                .find_by_key(&cx, "User", KeyTuple::single(3_i64), &FindOptions::new())
                .await,
        )
        .expect("identity map hit");
        assert!(cached.ptr_eq(&found));
    });
}

#[test]
fn test_parameterised_filter() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (factory, db) = common::submission_model()
        .filter(
            FilterDef::new("byEmail", Condition::eq_param("email", "email"))
                .entities(["User"])
                .default_enabled(false),
        )
        .build_in_memory()
        .expect("build model");
    db.seed(
        "User",
        [
            Row::from_pairs([
                ("id", Value::BigInt(1)),
                ("email", Value::Text("a@example.com".into())),
                ("deleted_at", Value::Null),
            ]),
            Row::from_pairs([
                ("id", Value::BigInt(2)),
                ("email", Value::Text("b@example.com".into())),
                ("deleted_at", Value::Null),
            ]),
        ],
    )
    .unwrap();

    rt.block_on(async {
        let mut session = factory.fork();
        session.enable_filter("byEmail").unwrap();

        let unbound = session
            .find_all(&cx, "User", Condition::True, &FindOptions::new())
            .await;
        assert!(matches!(unbound, Outcome::Err(Error::Filter(_))));

        session.set_filter_param("email", "b@example.com");
        let found = unwrap_outcome(
            session
                .find_all(&cx, "User", Condition::True, &FindOptions::new())
                .await,
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key(), KeyTuple::single(2_i64));
    });
}
