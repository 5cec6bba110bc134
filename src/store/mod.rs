pub mod sqlite;

pub use sqlite::SqlitePersistence;
