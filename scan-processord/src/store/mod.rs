pub mod db;

pub use db::{ScanDb, UpsertOutcome};
