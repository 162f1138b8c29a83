//! Write-ahead log engine for byte-addressable NVRAM tiered with block
//! storage. See [`wal::NvWal`] for the top-level instance API.
//!
//! The library never installs a logger; callers wire up `env_logger` (or
//! any other `log` backend) themselves, as `src/bin/nvwalctl.rs` does when
//! built with the `cli` feature.

pub mod config;
pub mod control;
pub mod cursor;
pub mod epoch;
pub mod error;
pub mod flusher;
pub mod fsyncer;
pub mod mds;
pub mod mmap;
pub mod segment;
pub mod state;
pub mod wait;
pub mod wal;
pub mod writer;

pub use config::{InitMode, NvWalConfig};
pub use cursor::LogCursor;
pub use epoch::Epoch;
pub use error::{Error, Result};
pub use wal::{NvWal, WriterHandle};
