//! Storage layer
//!
//! Key encoding, record framing and the ordered key-value substrate the
//! tables are built on.

pub mod atomic_file;
pub mod frame;
pub mod key_codec;
pub mod kv;

pub use frame::{FrameReader, FrameWriter, ReadOutcome};
pub use kv::{KvStore, WriteBatch};
