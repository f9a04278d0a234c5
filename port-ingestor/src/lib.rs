pub mod config;
pub mod error;
pub mod ingestor;
pub mod source;
