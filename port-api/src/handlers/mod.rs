mod app;
mod ports;

pub use app::{app, AppState};
