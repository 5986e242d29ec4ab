//!
//! # Disk Cache
//!
//! A persistent key/value cache living in a single directory, made to survive
//! process crashes without losing more than the entries that were being
//! written at the time.
//!
//! Each entry has a byte string key and three independent data streams, and
//! can instead hold a sparse payload addressed by 64-bit offsets. The cache
//! keeps itself under a size budget by evicting the least recently used
//! entries. What it stores:
//! - A hash index, `index`, mapping keys to entry records and holding the
//!   cache wide header;
//! - Block files, `data_0` to `data_3`, pooling fixed size blocks for records
//!   and small payloads;
//! - External files, `f_xxxxxx`, for payloads larger than 16 KiB;
//!
//! Entries are also linked into a persisted LRU list. Every change to that
//! list is journaled in the index header, so opening a cache after a crash
//! can finish or revert the interrupted change before checking the rest.
//!
//! All the disk work happens on one dedicated thread. The public API only
//! queues operations and hands back [`Completion`] futures, operations run in
//! the order they were issued.
//!
//! ## Basic example
//!
//! ```
//! use sd_disk_cache::{Backend, BackendConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let dir = tempfile::tempdir().unwrap();
//!     let backend = Backend::open(BackendConfig::new(dir.path())).await.unwrap();
//!
//!     let entry = backend.create_entry("some key").await.unwrap();
//!     entry.write_data(0, 0, b"some data".to_vec(), true).await.unwrap();
//!     entry.close();
//!
//!     let entry = backend.open_entry("some key").await.unwrap();
//!     assert_eq!(entry.read_data(0, 0, 64).await.unwrap(), b"some data");
//!
//!     backend.shutdown().await.unwrap();
//! }
//! ```
#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod addr;
mod backend;
mod completion;
mod config;
mod disk;
pub mod dump;
mod entry;
mod error;
mod format;
mod hash;
mod index;
mod rankings;
mod sparse;
mod stats;
mod storage;

#[cfg(any(test, feature = "fault-injection"))]
pub mod fault;

pub use backend::{Backend, EntryIterator};
pub use completion::Completion;
pub use config::{BackendConfig, DEFAULT_MAX_BYTES};
pub use entry::Entry;
pub use error::{Error, FileIOError};
pub use sparse::AvailableRange;
