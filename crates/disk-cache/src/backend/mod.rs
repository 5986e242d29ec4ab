//! The cache backend.
//!
//! A [`Backend`] owns one cache directory through a dedicated worker thread.
//! Every operation becomes a message on the worker's queue, so operations
//! run one at a time and in the order they were issued, and the caller gets
//! a [`Completion`] to await the outcome.

use std::{
	sync::{
		atomic::{AtomicU32, AtomicU64, Ordering},
		Arc, Mutex, PoisonError,
	},
	thread::{self, JoinHandle},
};

use async_channel as chan;
use chrono::{DateTime, Utc};
use tokio::{sync::oneshot, task::spawn_blocking};
use tracing::{error, instrument, trace, warn};

use crate::{
	completion::Completion,
	config::BackendConfig,
	entry::Entry,
	error::Error,
	rankings::{Direction, Rankings},
};

#[cfg(any(test, feature = "fault-injection"))]
use crate::fault::FaultInjector;

use message::{IteratorId, Message};

mod cursors;
mod enumeration;
mod eviction;
mod imp;
pub(crate) mod message;
mod recovery;
mod sparse_io;
mod worker;

struct Shared {
	msgs_tx: chan::Sender<Message>,
	entry_count: Arc<AtomicU32>,
	next_iterator: AtomicU64,
	worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Shared {
	fn drop(&mut self) {
		if self.msgs_tx.try_send(Message::ShutdownRequest(None)).is_err() {
			trace!("Backend dropped after shutdown");
		}
	}
}

/// Handle to an open cache, cheap to clone. The cache is closed by
/// [`Backend::shutdown`], or when the last clone is dropped.
#[derive(Clone)]
pub struct Backend {
	shared: Arc<Shared>,
}

impl Backend {
	/// Opens the cache at `config.path`, creating it if needed. A directory
	/// left by a crash is checked and repaired first.
	#[instrument(skip_all, fields(path = %config.path.display()))]
	pub async fn open(config: BackendConfig) -> Result<Self, Error> {
		Self::spawn(config, Rankings::default()).await
	}

	/// Like [`Self::open`], with `injector` deciding where list mutations
	/// crash.
	#[cfg(any(test, feature = "fault-injection"))]
	pub async fn open_with_fault_injector(
		config: BackendConfig,
		injector: Arc<dyn FaultInjector>,
	) -> Result<Self, Error> {
		Self::spawn(config, Rankings::with_injector(Some(injector))).await
	}

	async fn spawn(config: BackendConfig, rankings: Rankings) -> Result<Self, Error> {
		config.validate()?;

		let (msgs_tx, msgs_rx) = chan::unbounded();
		let (ready_tx, ready_rx) = oneshot::channel();
		let entry_count = Arc::new(AtomicU32::new(0));

		let handle = thread::Builder::new()
			.name("disk-cache-worker".into())
			.spawn({
				let msgs_tx = msgs_tx.clone();
				let entry_count = Arc::clone(&entry_count);
				move || worker::run(config, rankings, msgs_tx, msgs_rx, entry_count, ready_tx)
			})
			.map_err(|e| {
				error!(?e, "Failed to spawn disk cache worker");
				Error::Failed("couldn't spawn the worker thread")
			})?;

		ready_rx.await.unwrap_or(Err(Error::Canceled))?;

		Ok(Self {
			shared: Arc::new(Shared {
				msgs_tx,
				entry_count,
				next_iterator: AtomicU64::new(1),
				worker: Mutex::new(Some(handle)),
			}),
		})
	}

	fn send<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T, Error>>) -> Message) -> Completion<T> {
		Completion::send(&self.shared.msgs_tx, make)
	}

	/// Entries in the cache, as of the last operation the worker finished.
	#[must_use]
	pub fn entry_count(&self) -> u32 {
		self.shared.entry_count.load(Ordering::Acquire)
	}

	/// Creates the entry for `key`, failing if there is one already.
	pub fn create_entry(&self, key: impl Into<Vec<u8>>) -> Completion<Entry> {
		let key = key.into();
		self.send(|ack| Message::CreateEntry { key, ack })
	}

	pub fn open_entry(&self, key: impl Into<Vec<u8>>) -> Completion<Entry> {
		let key = key.into();
		self.send(|ack| Message::OpenEntry { key, ack })
	}

	/// Removes the entry for `key`. Handles already open keep working until
	/// they are dropped.
	pub fn doom_entry(&self, key: impl Into<Vec<u8>>) -> Completion<()> {
		let key = key.into();
		self.send(|ack| Message::DoomEntry { key, ack })
	}

	pub fn doom_all_entries(&self) -> Completion<()> {
		self.send(Message::DoomAllEntries)
	}

	/// Dooms the entries last used at or after `initial` and before `end`.
	pub fn doom_entries_between(
		&self,
		initial: DateTime<Utc>,
		end: DateTime<Utc>,
	) -> Completion<()> {
		let (initial, end) = (initial.timestamp_micros(), end.timestamp_micros());
		self.send(|ack| Message::DoomEntriesBetween {
			initial,
			end: Some(end),
			ack,
		})
	}

	pub fn doom_entries_since(&self, initial: DateTime<Utc>) -> Completion<()> {
		let initial = initial.timestamp_micros();
		self.send(|ack| Message::DoomEntriesBetween {
			initial,
			end: None,
			ack,
		})
	}

	/// Starts an enumeration. Walking it opens every entry in turn without
	/// counting as a use of them.
	#[must_use]
	pub fn enumerate(&self) -> EntryIterator {
		EntryIterator {
			id: self.shared.next_iterator.fetch_add(1, Ordering::Relaxed),
			msgs_tx: self.shared.msgs_tx.clone(),
		}
	}

	/// Next entry from the most recently used end, `None` once exhausted.
	pub fn open_next_entry(&self, iterator: &EntryIterator) -> Completion<Option<Entry>> {
		self.step(iterator, Direction::Forward)
	}

	/// Next entry from the least recently used end.
	pub fn open_prev_entry(&self, iterator: &EntryIterator) -> Completion<Option<Entry>> {
		self.step(iterator, Direction::Backward)
	}

	fn step(&self, iterator: &EntryIterator, direction: Direction) -> Completion<Option<Entry>> {
		let iterator = iterator.id;
		self.send(|ack| Message::OpenNextEntry {
			iterator,
			direction,
			ack,
		})
	}

	pub fn end_enumeration(&self, iterator: EntryIterator) {
		drop(iterator);
	}

	/// Name and value pairs describing the cache.
	pub fn stats(&self) -> Completion<Vec<(String, String)>> {
		self.send(Message::Stats)
	}

	/// Records that the embedder served `key` from elsewhere, refreshing the
	/// entry's place in the eviction order.
	pub fn on_external_cache_hit(&self, key: impl Into<Vec<u8>>) {
		if self
			.shared
			.msgs_tx
			.try_send(Message::ExternalCacheHit(key.into()))
			.is_err()
		{
			trace!("Backend already shutdown, dropping external hit");
		}
	}

	/// Changes the size budget, evicting right away if the cache is over it.
	pub fn set_max_size(&self, max_bytes: u64) -> Completion<()> {
		if max_bytes == 0 {
			return Completion::rejected(Error::InvalidArgument("size budget must be positive"));
		}

		self.send(|ack| Message::SetMaxSize { max_bytes, ack })
	}

	/// Verifies that the index, the list and the entry counter agree.
	/// Returns the number of entries.
	pub fn self_check(&self) -> Completion<u32> {
		self.send(Message::SelfCheck)
	}

	/// Persists the header and syncs the index to disk.
	pub fn flush(&self) -> Completion<()> {
		self.send(Message::Flush)
	}

	/// Closes the cache and waits for the worker to exit. Entry operations
	/// queued before still run; other pending requests resolve as canceled.
	pub async fn shutdown(&self) -> Result<(), Error> {
		let Some(handle) = self
			.shared
			.worker
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take()
		else {
			warn!("Trying to shutdown a disk cache backend that was already shutdown");
			return Ok(());
		};

		let (tx, rx) = oneshot::channel();

		if self
			.shared
			.msgs_tx
			.try_send(Message::ShutdownRequest(Some(tx)))
			.is_ok() && rx.await.is_err()
		{
			warn!("Disk cache worker exited before acknowledging shutdown");
		}

		spawn_blocking(move || handle.join())
			.await
			.map_err(|e| {
				error!(?e, "Failed to join disk cache worker");
				Error::Failed("couldn't join the worker thread")
			})?
			.map_err(|_| {
				error!("Disk cache worker panicked");
				Error::Failed("the worker thread panicked")
			})
	}
}

/// An enumeration in progress, see [`Backend::enumerate`]. Dropping it ends
/// the enumeration.
#[derive(Debug)]
pub struct EntryIterator {
	id: IteratorId,
	msgs_tx: chan::Sender<Message>,
}

impl Drop for EntryIterator {
	fn drop(&mut self) {
		if self
			.msgs_tx
			.try_send(Message::EndEnumeration(self.id))
			.is_err()
		{
			trace!(iterator = self.id, "Backend already shutdown, nothing to end");
		}
	}
}
