pub mod append;
pub mod database;
pub mod persistence;
pub mod reader;
pub mod recovery;
pub mod writer;

pub use database::{Database, FaultPoint, Transaction, UnitOfWork};
