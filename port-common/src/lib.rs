pub mod metrics;
pub mod port;
pub mod repository;
pub mod stream;
