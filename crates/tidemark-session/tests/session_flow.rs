//! End-to-end tests for the session's unit-of-work flow: persist,
//! cascade, flush ordering, find, removal, and orphan cleanup.
//!
//! These run against the in-memory driver -- the same structured
//! statements the `PostgreSQL` driver renders, interpreted over maps --
//! so no external services are needed.

// Tests use expect/unwrap extensively for clarity -- panicking on failure
// is the correct behavior in test code.
#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    clippy::items_after_statements,
    clippy::missing_panics_doc,
    clippy::too_many_lines,
    clippy::indexing_slicing
)]

mod common;

use common::{author, book, memory_factory, write_log};
use tidemark_driver::MemoryDriver;
use tidemark_session::SessionError;
use tidemark_types::{Value, entity};

#[tokio::test]
async fn persist_cascade_flushes_in_dependency_order() {
    let driver = MemoryDriver::new();
    let factory = memory_factory(&driver);
    let mut session = factory.open();

    // A new author with one new book; the book holds a non-nullable FK to
    // the author, so the author's insert must come first even though only
    // the book's parent was persisted.
    let frank = author(1, "Frank Herbert");
    let dune = book(10, "Dune");
    entity::write(&dune).set_assoc("author", &frank);
    entity::write(&frank).add_child("books", &dune);

    session.persist(&frank).unwrap();
    session.flush().await.unwrap();

    assert_eq!(
        write_log(&driver),
        vec![
            ("insert".to_owned(), "authors".to_owned()),
            ("insert".to_owned(), "books".to_owned()),
        ]
    );

    let books = driver.rows("books");
    assert_eq!(books.len(), 1);
    assert_eq!(books[0].get("author_id"), Some(&Value::Int(1)));
    assert_eq!(books[0].get("version"), Some(&Value::Int(0)));
}

#[tokio::test]
async fn find_absent_identity_returns_none_without_error() {
    let driver = MemoryDriver::new();
    let factory = memory_factory(&driver);
    let mut session = factory.open();

    let found = session.find("Book", Value::Int(404)).await.unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn persist_flush_find_roundtrips_mapped_fields() {
    let driver = MemoryDriver::new();
    let factory = memory_factory(&driver);

    let mut writer = factory.open();
    let ursula = author(7, "Ursula K. Le Guin");
    writer.persist(&ursula).unwrap();
    writer.flush().await.unwrap();
    writer.close().await;

    // A fresh session sees exactly what was persisted.
    let mut reader = factory.open();
    let found = reader
        .find("Author", Value::Int(7))
        .await
        .unwrap()
        .expect("author should exist");
    let guard = entity::read(&found);
    assert_eq!(guard.field("name"), Some(&Value::from("Ursula K. Le Guin")));
    assert_eq!(guard.key(), Some(&Value::Int(7)));
}

#[tokio::test]
async fn find_twice_returns_the_same_managed_instance() {
    let driver = MemoryDriver::new();
    driver.seed_row(
        "authors",
        [
            ("id".to_owned(), Value::Int(1)),
            ("name".to_owned(), Value::from("N. K. Jemisin")),
            ("version".to_owned(), Value::Int(0)),
        ],
    );
    let factory = memory_factory(&driver);
    let mut session = factory.open();

    let first = session.find("Author", Value::Int(1)).await.unwrap().unwrap();
    let second = session.find("Author", Value::Int(1)).await.unwrap().unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn closed_session_rejects_operations_and_schedules_nothing() {
    let driver = MemoryDriver::new();
    let factory = memory_factory(&driver);
    let mut session = factory.open();
    session.close().await;

    let orphan = author(1, "Nobody");
    let result = session.persist(&orphan);
    assert!(matches!(result, Err(SessionError::Closed)));
    assert!(driver.statements().is_empty());

    let found = session.find("Author", Value::Int(1)).await;
    assert!(matches!(found, Err(SessionError::Closed)));
}

#[tokio::test]
async fn remove_before_flush_cancels_the_insert() {
    let driver = MemoryDriver::new();
    let factory = memory_factory(&driver);
    let mut session = factory.open();

    let ghost = author(9, "Ghost Writer");
    session.persist(&ghost).unwrap();
    session.remove(&ghost).unwrap();
    session.flush().await.unwrap();

    assert!(driver.statements().is_empty());
    assert!(driver.rows("authors").is_empty());
}

#[tokio::test]
async fn cascaded_remove_deletes_children_before_the_parent() {
    let driver = MemoryDriver::new();
    let factory = memory_factory(&driver);
    let mut session = factory.open();

    let frank = author(1, "Frank Herbert");
    let dune = book(10, "Dune");
    let messiah = book(11, "Dune Messiah");
    entity::write(&dune).set_assoc("author", &frank);
    entity::write(&messiah).set_assoc("author", &frank);
    entity::write(&frank).add_child("books", &dune);
    entity::write(&frank).add_child("books", &messiah);

    session.persist(&frank).unwrap();
    session.flush().await.unwrap();
    driver.clear_log();

    session.remove(&frank).unwrap();
    session.flush().await.unwrap();

    assert_eq!(
        write_log(&driver),
        vec![
            ("delete".to_owned(), "books".to_owned()),
            ("delete".to_owned(), "books".to_owned()),
            ("delete".to_owned(), "authors".to_owned()),
        ]
    );
    assert!(driver.rows("authors").is_empty());
    assert!(driver.rows("books").is_empty());
}

#[tokio::test]
async fn detaching_a_child_from_an_owning_collection_deletes_it() {
    let driver = MemoryDriver::new();
    let factory = memory_factory(&driver);
    let mut session = factory.open();

    let frank = author(1, "Frank Herbert");
    let dune = book(10, "Dune");
    entity::write(&dune).set_assoc("author", &frank);
    entity::write(&frank).add_child("books", &dune);

    session.persist(&frank).unwrap();
    session.flush().await.unwrap();
    driver.clear_log();

    // No remove call anywhere -- dropping the child from the exclusively
    // owning collection is enough.
    entity::write(&frank).remove_child("books", &dune);
    session.flush().await.unwrap();

    assert_eq!(
        write_log(&driver),
        vec![("delete".to_owned(), "books".to_owned())]
    );
    assert!(driver.rows("books").is_empty());
    assert_eq!(driver.rows("authors").len(), 1);
}

#[tokio::test]
async fn dirty_update_writes_only_changed_columns() {
    let driver = MemoryDriver::new();
    let factory = memory_factory(&driver);
    let mut session = factory.open();

    let octavia = author(3, "Octavia");
    session.persist(&octavia).unwrap();
    session.flush().await.unwrap();
    driver.clear_log();

    entity::write(&octavia).set_field("name", "Octavia E. Butler");
    session.flush().await.unwrap();

    let statements = driver.statements();
    assert_eq!(statements.len(), 1);
    match &statements[0] {
        tidemark_driver::Statement::Update {
            table,
            assignments,
            predicate,
        } => {
            assert_eq!(table, "authors");
            // Changed column plus the version bump, nothing else.
            let columns: Vec<&str> =
                assignments.iter().map(|(c, _)| c.as_str()).collect();
            assert_eq!(columns, vec!["name", "version"]);
            // Predicate carries the optimistic version check.
            assert!(predicate.iter().any(|(c, _)| c == "version"));
        }
        other => panic!("expected an update, got {other:?}"),
    }

    let rows = driver.rows("authors");
    assert_eq!(rows[0].get("name"), Some(&Value::from("Octavia E. Butler")));
    assert_eq!(rows[0].get("version"), Some(&Value::Int(1)));
}

#[tokio::test]
async fn second_instance_for_a_managed_identity_conflicts() {
    let driver = MemoryDriver::new();
    driver.seed_row(
        "authors",
        [
            ("id".to_owned(), Value::Int(1)),
            ("name".to_owned(), Value::from("First")),
            ("version".to_owned(), Value::Int(0)),
        ],
    );
    let factory = memory_factory(&driver);
    let mut session = factory.open();

    let _managed = session.find("Author", Value::Int(1)).await.unwrap().unwrap();
    let imposter = author(1, "Imposter");
    let result = session.persist(&imposter);
    assert!(matches!(
        result,
        Err(SessionError::Context(
            tidemark_context::ContextError::IdentityConflict(_)
        ))
    ));
}

#[tokio::test]
async fn clean_flush_sends_nothing() {
    let driver = MemoryDriver::new();
    driver.seed_row(
        "authors",
        [
            ("id".to_owned(), Value::Int(1)),
            ("name".to_owned(), Value::from("Unchanged")),
            ("version".to_owned(), Value::Int(0)),
        ],
    );
    let factory = memory_factory(&driver);
    let mut session = factory.open();

    let _loaded = session.find("Author", Value::Int(1)).await.unwrap().unwrap();
    driver.clear_log();
    session.flush().await.unwrap();
    assert!(driver.statements().is_empty());
}

#[tokio::test]
async fn merge_copies_detached_state_onto_the_managed_instance() {
    let driver = MemoryDriver::new();
    driver.seed_row(
        "authors",
        [
            ("id".to_owned(), Value::Int(1)),
            ("name".to_owned(), Value::from("Old Name")),
            ("version".to_owned(), Value::Int(2)),
        ],
    );
    let factory = memory_factory(&driver);
    let mut session = factory.open();

    // A detached copy, edited offline.
    let detached = tidemark_types::Entity::new("Author")
        .with_key(Value::Int(1))
        .with_field("name", "New Name");

    let managed = session.merge(&detached).await.unwrap();
    assert_eq!(
        entity::read(&managed).field("name"),
        Some(&Value::from("New Name"))
    );

    session.flush().await.unwrap();
    let rows = driver.rows("authors");
    assert_eq!(rows[0].get("name"), Some(&Value::from("New Name")));
    assert_eq!(rows[0].get("version"), Some(&Value::Int(3)));
}

#[tokio::test]
async fn refresh_discards_in_memory_changes() {
    let driver = MemoryDriver::new();
    driver.seed_row(
        "authors",
        [
            ("id".to_owned(), Value::Int(1)),
            ("name".to_owned(), Value::from("Stored")),
            ("version".to_owned(), Value::Int(0)),
        ],
    );
    let factory = memory_factory(&driver);
    let mut session = factory.open();

    let loaded = session.find("Author", Value::Int(1)).await.unwrap().unwrap();
    entity::write(&loaded).set_field("name", "Scribbled over");

    session.refresh(&loaded).await.unwrap();
    assert_eq!(
        entity::read(&loaded).field("name"),
        Some(&Value::from("Stored"))
    );

    // Nothing dirty remains after the refresh.
    driver.clear_log();
    session.flush().await.unwrap();
    assert!(driver.statements().is_empty());
}

#[tokio::test]
async fn sequence_strategy_allocates_keys_during_flush() {
    use tidemark_types::{EntityMeta, IdStrategy, MetadataRegistry};

    let registry = MetadataRegistry::builder()
        .entity(
            EntityMeta::define("Order", "orders")
                .key(
                    "id",
                    IdStrategy::Sequence {
                        sequence: "order_id_seq".to_owned(),
                    },
                )
                .field("total"),
        )
        .build()
        .unwrap();
    let driver = MemoryDriver::new();
    let factory =
        tidemark_session::SessionFactory::new(std::sync::Arc::new(registry), std::sync::Arc::new(driver.clone()));
    let mut session = factory.open();

    let order = tidemark_types::Entity::new("Order")
        .with_field("total", 40i64)
        .into_handle();
    session.persist(&order).unwrap();
    session.flush().await.unwrap();

    assert_eq!(entity::read(&order).key(), Some(&Value::Int(1)));
    let rows = driver.rows("orders");
    assert_eq!(rows[0].get("id"), Some(&Value::Int(1)));

    // The key is visible to find() through the normal identity path.
    let found = session.find("Order", Value::Int(1)).await.unwrap();
    assert!(found.is_some_and(|f| std::sync::Arc::ptr_eq(&f, &order)));
}
