//! Record-level types

pub mod log_entry;
pub mod timestamp;

pub use log_entry::{Dimension, LogEntry, MethodType, TsDimension};
pub use timestamp::now_millis;
