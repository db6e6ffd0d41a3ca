//! Input side: coercion, parsing, duplicate detection and the import engine.

pub mod coercion;
pub mod duplicates;
pub mod errors;
pub mod import;
pub mod parser;

pub use errors::{ImportError, ImportFailure};
pub use import::{ImportEngine, ImportProgress, ImportResult};
