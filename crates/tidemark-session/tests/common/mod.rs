//! Shared fixtures for the session integration tests.
//!
//! All tests run against the in-memory driver, which interprets the same
//! structured statements the `PostgreSQL` driver renders, so the full
//! plan-and-execute path is exercised without Docker.

#![allow(dead_code)]
#![allow(clippy::expect_used)]

use std::sync::Arc;

use tidemark_driver::{MemoryDriver, Statement};
use tidemark_session::SessionFactory;
use tidemark_types::{
    CascadeSet, Entity, EntityHandle, EntityMeta, IdStrategy, MetadataRegistry, Value,
};

/// Author 1-* Book with full cascade and orphan removal; both versioned.
/// Book holds a non-nullable foreign key to Author.
pub fn library_registry() -> Arc<MetadataRegistry> {
    let registry = MetadataRegistry::builder()
        .entity(
            EntityMeta::define("Author", "authors")
                .key("id", IdStrategy::Assigned)
                .field("name")
                .versioned("version")
                .one_to_many("books", "Book", "author", CascadeSet::all(), true),
        )
        .entity(
            EntityMeta::define("Book", "books")
                .key("id", IdStrategy::Assigned)
                .field("title")
                .versioned("version")
                .many_to_one("author", "Author", "author_id", false, CascadeSet::none()),
        )
        .build();
    Arc::new(registry.expect("registry must validate"))
}

/// A factory over the in-memory driver and the library registry.
pub fn memory_factory(driver: &MemoryDriver) -> SessionFactory {
    SessionFactory::new(library_registry(), Arc::new(driver.clone()))
}

pub fn author(id: i64, name: &str) -> EntityHandle {
    Entity::new("Author")
        .with_key(Value::Int(id))
        .with_field("name", name)
        .into_handle()
}

pub fn book(id: i64, title: &str) -> EntityHandle {
    Entity::new("Book")
        .with_key(Value::Int(id))
        .with_field("title", title)
        .into_handle()
}

/// The `(kind, table)` shape of every data statement executed so far,
/// skipping transaction control and reads.
pub fn write_log(driver: &MemoryDriver) -> Vec<(String, String)> {
    driver
        .statements()
        .into_iter()
        .filter_map(|statement| match statement {
            Statement::Insert { table, .. } => Some(("insert".to_owned(), table)),
            Statement::Update { table, .. } => Some(("update".to_owned(), table)),
            Statement::Delete { table, .. } => Some(("delete".to_owned(), table)),
            _ => None,
        })
        .collect()
}
