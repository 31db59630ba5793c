// Repository layer for database operations

pub mod attempt;
mod queries;

pub use attempt::PgAttemptStore;
