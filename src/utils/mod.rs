//! Ambient support utilities

mod logger;

pub use logger::setup_logging;
