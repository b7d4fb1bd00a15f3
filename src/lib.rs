pub mod cli;
pub mod config;
pub mod error;
pub mod extract;
pub mod merge;
pub mod normalization;
pub mod payload;
pub mod report;
pub mod safety;
pub mod store;
pub mod tracing;
pub mod validate;
pub mod writer;

pub mod util {
    pub mod db;
    pub mod env;
}

pub use error::{MigrateError, SourceError};
pub use payload::ExportPayload;
