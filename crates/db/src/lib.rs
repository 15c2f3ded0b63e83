pub mod connection;
pub mod executor;
pub mod fixtures;
pub mod migrations;

pub use connection::{connect, connect_with_settings, DbPool};
pub use executor::SqlQueryExecutor;
pub use fixtures::{seed_demo_dataset, SeedResult};
