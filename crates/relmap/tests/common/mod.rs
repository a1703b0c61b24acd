//! Shared models and fixtures for the integration tests.

#![allow(dead_code)]

use relmap::prelude::*;
use relmap::{MemoryExecutor, OrmBuilder};

pub fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

/// Organisations own authors and books; both are keyed by `(org, id)`
/// through an abstract base, and a book's author shares the book's `org_id`.
pub fn org_model() -> OrmBuilder {
    Orm::builder()
        .entity(
            EntityDescriptor::new("Organisation")
                .field(FieldDescriptor::scalar("id").primary_key())
                .field(FieldDescriptor::scalar("name")),
        )
        .entity(
            EntityDescriptor::abstract_entity("OrgEntity")
                .field(
                    FieldDescriptor::reference("org", RelationshipKind::ManyToOne, "Organisation")
                        .join("org_id", "id")
                        .primary_key()
                        .delete_rule(DeleteRule::Cascade),
                )
                .field(FieldDescriptor::scalar("id").primary_key()),
        )
        .entity(
            EntityDescriptor::new("Author")
                .extends("OrgEntity")
                .field(FieldDescriptor::scalar("name"))
                .field(FieldDescriptor::inverse(
                    "book",
                    RelationshipKind::OneToOne,
                    "Book",
                    "author",
                )),
        )
        .entity(
            EntityDescriptor::new("Book")
                .extends("OrgEntity")
                .field(FieldDescriptor::scalar("name"))
                .field(
                    FieldDescriptor::reference("author", RelationshipKind::OneToOne, "Author")
                        .join_shared("org_id", "org_id")
                        .join("author_id", "id")
                        .nullable(),
                ),
        )
}

/// Organisation 1 with author 1 and book 1 written by that author.
pub fn seeded_org() -> (SessionFactory<MemoryExecutor>, MemoryDatabase) {
    let (factory, db) = org_model().build_in_memory().expect("build org model");
    db.seed(
        "Organisation",
        [
            Row::from_pairs([("id", Value::BigInt(1)), ("name", Value::Text("Org A".into()))]),
            Row::from_pairs([("id", Value::BigInt(2)), ("name", Value::Text("Org B".into()))]),
        ],
    )
    .expect("seed organisations");
    db.seed(
        "Author",
        [Row::from_pairs([
            ("org_id", Value::BigInt(1)),
            ("id", Value::BigInt(1)),
            ("name", Value::Text("Alice".into())),
        ])],
    )
    .expect("seed authors");
    db.seed(
        "Book",
        [Row::from_pairs([
            ("org_id", Value::BigInt(1)),
            ("id", Value::BigInt(1)),
            ("name", Value::Text("First Book".into())),
            ("author_id", Value::BigInt(1)),
        ])],
    )
    .expect("seed books");
    (factory, db)
}

/// Users with a soft-delete column and submissions that must reference one.
pub fn submission_model() -> OrmBuilder {
    Orm::builder()
        .entity(
            EntityDescriptor::new("User")
                .field(FieldDescriptor::scalar("id").primary_key().generated())
                .field(FieldDescriptor::scalar("email").unique())
                .field(FieldDescriptor::scalar("deleted_at").nullable()),
        )
        .entity(
            EntityDescriptor::new("Submission")
                .field(FieldDescriptor::scalar("id").primary_key().generated())
                .field(FieldDescriptor::scalar("title"))
                .field(
                    FieldDescriptor::reference("user", RelationshipKind::ManyToOne, "User")
                        .join("user_id", "id"),
                ),
        )
        .filter(FilterDef::new("softDelete", Condition::is_null("deleted_at")))
}

/// Three users, the third soft-deleted, each with one submission.
pub fn seeded_submissions() -> (SessionFactory<MemoryExecutor>, MemoryDatabase) {
    let (factory, db) = submission_model()
        .build_in_memory()
        .expect("build submission model");
    db.seed(
        "User",
        (1..=3_i64).map(|id| {
            let deleted = if id == 3 {
                Value::Text("2024-01-01T00:00:00Z".into())
            } else {
                Value::Null
            };
            Row::from_pairs([
                ("id", Value::BigInt(id)),
                ("email", Value::Text(format!("user{id}@example.com"))),
                ("deleted_at", deleted),
            ])
        }),
    )
    .expect("seed users");
    db.seed(
        "Submission",
        (1..=3_i64).map(|id| {
            Row::from_pairs([
                ("id", Value::BigInt(id)),
                ("title", Value::Text(format!("Submission {id}"))),
                ("user_id", Value::BigInt(id)),
            ])
        }),
    )
    .expect("seed submissions");
    (factory, db)
}
