use std::{
	collections::{HashMap, HashSet, VecDeque},
	fs,
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicU32, Ordering},
		Arc, Weak,
	},
};

use async_channel as chan;
use chrono::Utc;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
	addr::Addr,
	config::BackendConfig,
	disk::Disk,
	entry::{imp::EntryImpl, imp::read_key, Entry, EntryShared},
	error::{Error, FileIOError},
	format::{EntryState, EntryStore},
	hash::key_hash,
	index::{IndexFile, INDEX_NAME},
	rankings::{Direction, Rankings, Unlink},
	stats::{Gauges, Stats},
	storage::{remove_file, Storage},
};

use super::{
	cursors::Cursors,
	message::Message,
	sparse_io::SparseState,
};

/// Worker side state of an entry with live handles or internal users.
#[derive(Debug)]
pub(super) struct OpenEntry {
	pub imp: EntryImpl,
	handle: Weak<EntryShared>,
	/// Generation of the current user handle, `None` once it was released.
	user_generation: Option<u64>,
	/// Internal references: sparse operations and bulk walks holding the
	/// entry open across calls.
	in_flight: u32,
	pub sparse: Option<SparseState>,
}

impl OpenEntry {
	const fn new(imp: EntryImpl) -> Self {
		Self {
			imp,
			handle: Weak::new(),
			user_generation: None,
			in_flight: 1,
			sparse: None,
		}
	}

	/// Keeps the entry open until a matching [`BackendImpl::release_internal`].
	pub fn hold(&mut self) {
		self.in_flight += 1;
	}

	const fn is_idle(&self) -> bool {
		self.user_generation.is_none() && self.in_flight == 0
	}
}

/// Monotonic microsecond clock, two reads never return the same value.
#[derive(Debug, Default)]
struct Clock {
	last: i64,
}

impl Clock {
	fn now(&mut self) -> i64 {
		self.last = Utc::now().timestamp_micros().max(self.last + 1);
		self.last
	}
}

/// Everything the worker thread owns.
pub(super) struct BackendImpl {
	path: PathBuf,
	pub disk: Disk,
	pub rankings: Rankings,
	pub max_bytes: u64,
	pub sparse_enabled: bool,
	pub open: HashMap<Addr, OpenEntry>,
	pub cursors: Cursors,
	pub stats: Stats,
	clock: Clock,
	next_generation: u64,
	pub tx: chan::Sender<Message>,
	/// Sparse steps that couldn't be queued because the channel is closed,
	/// run while draining.
	pub deferred: VecDeque<Addr>,
	entry_count: Arc<AtomicU32>,
}

impl BackendImpl {
	#[instrument(skip_all, fields(path = %config.path.display()))]
	pub fn init(
		config: &BackendConfig,
		rankings: Rankings,
		tx: chan::Sender<Message>,
		entry_count: Arc<AtomicU32>,
	) -> Result<Self, Error> {
		let path = config.path.clone();
		fs::create_dir_all(&path)
			.map_err(|e| FileIOError::from((&path, e, "Failed to create cache directory")))?;

		let mut clock = Clock::default();
		let table_len = config.effective_table_len();

		let disk = match open_disk(&path) {
			Ok(Some(disk)) => disk,
			Ok(None) => {
				info!(table_len, "Creating new cache");
				create_disk(&path, table_len, clock.now())?
			}
			Err(e) if config.force => {
				warn!(?e, "Existing cache is unusable, starting over");
				delete_cache_files(&path)?;
				create_disk(&path, table_len, clock.now())?
			}
			Err(e) => return Err(e),
		};

		let mut this = Self {
			path,
			disk,
			rankings,
			max_bytes: config.effective_max_bytes(),
			sparse_enabled: config.sparse_enabled,
			open: HashMap::new(),
			cursors: Cursors::default(),
			stats: Stats::default(),
			clock,
			next_generation: 0,
			tx,
			deferred: VecDeque::new(),
			entry_count,
		};

		let crashed = this.disk.header().crash;
		this.start_session()?;

		if crashed {
			match this.recover() {
				Ok(()) => {}
				Err(e) if !e.is_fatal() && config.force => {
					error!(?e, "Failed to recover cache, starting over");
					this.restart()?;
				}
				Err(e) => return Err(e),
			}
		}

		this.publish_count();

		debug!(
			entries = this.disk.header().num_entries,
			bytes = this.disk.header().num_bytes,
			this_id = this.this_id(),
			"Cache ready"
		);

		Ok(this)
	}

	/// Bumps the session id and flags the directory as in use until a clean
	/// shutdown clears it.
	fn start_session(&mut self) -> Result<(), Error> {
		let header = self.disk.header_mut();
		header.this_id = header.this_id.wrapping_add(1).max(1);
		header.crash = true;
		self.disk.store_header()
	}

	pub fn this_id(&self) -> u32 {
		self.disk.header().this_id
	}

	pub fn now(&mut self) -> i64 {
		self.clock.now()
	}

	pub fn publish_count(&self) {
		self.entry_count
			.store(self.disk.header().num_entries, Ordering::Release);
	}

	/// Throws every file away and starts a new generation of the cache in
	/// the same directory. Enumerations in progress end.
	pub fn restart(&mut self) -> Result<(), Error> {
		let this_id = self.this_id();
		let table_len = u32::try_from(self.disk.index.table_len())
			.map_err(|_| Error::Corrupted("hash table is too large".into()))?;

		info!(this_id, "Restarting cache");

		delete_cache_files(&self.path)?;
		let now = self.clock.now();
		self.disk = create_disk(&self.path, table_len, now)?;

		let header = self.disk.header_mut();
		header.this_id = this_id;
		self.start_session()?;

		self.cursors.reset();
		self.publish_count();

		Ok(())
	}

	// Hash chains

	/// Current record at `addr`, from the open copy if there is one.
	pub fn chain_record(&mut self, addr: Addr) -> Result<EntryStore, Error> {
		if let Some(open) = self.open.get(&addr) {
			return Ok(open.imp.store.clone());
		}

		self.disk.load_entry(addr)
	}

	/// Walks the chain for `key`. A damaged record cuts the chain right
	/// before it, the entries past it are lost.
	pub fn find_entry(&mut self, key: &[u8]) -> Result<Option<Addr>, Error> {
		let hash = key_hash(key);
		let bucket = self.disk.index.bucket_for(hash);

		let mut prev = None;
		let mut current = self.disk.index.bucket(bucket);
		let mut visited = HashSet::new();

		while current.is_initialized() {
			if !visited.insert(current) {
				warn!(%current, bucket, "Hash chain loops back on itself");
				self.stats.invalid_entry += 1;
				self.set_chain_link(bucket, prev, Addr::NULL)?;
				return Ok(None);
			}

			let matched = self.chain_record(current).and_then(|store| {
				let matched = store.state == EntryState::Normal
					&& store.hash == hash
					&& store.key_len as usize == key.len()
					&& read_key(&mut self.disk, &store)? == key;
				Ok((matched, store.next))
			});

			match matched {
				Ok((true, _)) => return Ok(Some(current)),
				Ok((false, next)) => {
					prev = Some(current);
					current = next;
				}
				Err(Error::Corrupted(reason)) => {
					warn!(%current, %reason, "Dropping damaged hash chain tail");
					self.stats.invalid_entry += 1;
					self.set_chain_link(bucket, prev, Addr::NULL)?;
					return Ok(None);
				}
				Err(e) => return Err(e),
			}
		}

		Ok(None)
	}

	/// Points the bucket (when `prev` is `None`) or the record `prev` at `next`.
	pub fn set_chain_link(
		&mut self,
		bucket: usize,
		prev: Option<Addr>,
		next: Addr,
	) -> Result<(), Error> {
		let Some(prev) = prev else {
			return self.disk.index.set_bucket(bucket, next);
		};

		if let Some(open) = self.open.get_mut(&prev) {
			open.imp.store.next = next;
			return open.imp.store(&mut self.disk);
		}

		let mut store = self.disk.load_entry(prev)?;
		store.next = next;
		self.disk.store_entry(prev, &store)
	}

	/// Takes the record at `addr` out of its chain.
	pub fn unlink_from_chain(&mut self, addr: Addr, hash: u32, next: Addr) -> Result<(), Error> {
		let bucket = self.disk.index.bucket_for(hash);
		let mut prev = None;
		let mut current = self.disk.index.bucket(bucket);
		let mut visited = HashSet::new();

		while current.is_initialized() && visited.insert(current) {
			if current == addr {
				return self.set_chain_link(bucket, prev, next);
			}

			prev = Some(current);
			current = self.chain_record(current)?.next;
		}

		warn!(%addr, bucket, "Entry missing from its hash chain");
		Ok(())
	}

	// Open entries

	/// Loads the entry at `addr` if needed and takes an internal reference,
	/// which [`Self::release_internal`] gives back.
	pub fn open_internal(&mut self, addr: Addr) -> Result<(), Error> {
		if let Some(open) = self.open.get_mut(&addr) {
			open.hold();
			return Ok(());
		}

		let mut imp = EntryImpl::load(&mut self.disk, addr)?;
		let this_id = self.this_id();
		imp.set_dirty(&mut self.disk, this_id)?;

		trace!(%addr, "Opened entry");
		self.open.insert(addr, OpenEntry::new(imp));

		Ok(())
	}

	pub fn release_internal(&mut self, addr: Addr) -> Result<(), Error> {
		let Some(open) = self.open.get_mut(&addr) else {
			return Ok(());
		};

		open.in_flight = open.in_flight.saturating_sub(1);
		if open.is_idle() {
			self.close_entry(addr)?;
		}

		Ok(())
	}

	/// Runs `f` holding an internal reference to `addr`. After a fatal error
	/// nothing else is written, the reference included.
	pub fn with_internal<T>(
		&mut self,
		addr: Addr,
		f: impl FnOnce(&mut Self) -> Result<T, Error>,
	) -> Result<T, Error> {
		self.open_internal(addr)?;

		let res = f(self);
		if res.as_ref().is_err_and(Error::is_fatal) {
			return res;
		}

		self.release_internal(addr)?;
		res
	}

	/// The user handle of an open entry, created if every previous one was
	/// dropped already.
	pub fn user_handle(&mut self, addr: Addr) -> Result<Entry, Error> {
		let open = self.open.get_mut(&addr).ok_or(Error::NotFound)?;

		if let Some(entry) = Entry::upgrade(&open.handle) {
			return Ok(entry);
		}

		self.next_generation += 1;
		let entry = Entry::new(
			addr,
			self.next_generation,
			Arc::clone(&open.imp.info),
			self.tx.clone(),
		);
		open.handle = entry.downgrade();
		open.user_generation = Some(self.next_generation);

		Ok(entry)
	}

	/// The last clone of a user handle was dropped.
	pub fn release(&mut self, addr: Addr, generation: u64) -> Result<(), Error> {
		let Some(open) = self.open.get_mut(&addr) else {
			trace!(%addr, "Release for an entry that is already closed");
			return Ok(());
		};

		if open.user_generation != Some(generation) {
			trace!(%addr, generation, "Ignoring release of a stale handle");
			return Ok(());
		}

		open.user_generation = None;
		if open.is_idle() {
			self.close_entry(addr)?;
		}

		Ok(())
	}

	/// Flushes an entry nobody uses anymore, or frees it if it was doomed.
	fn close_entry(&mut self, addr: Addr) -> Result<(), Error> {
		let Some(mut open) = self.open.remove(&addr) else {
			return Ok(());
		};

		trace!(%addr, doomed = open.imp.doomed, "Closing entry");

		if open.imp.doomed {
			open.imp.free_storage(&mut self.disk)
		} else {
			open.imp.set_dirty(&mut self.disk, 0)
		}
	}

	/// Moves an open entry to the head of the list, refreshing its times.
	/// Doomed entries are left alone.
	pub fn touch(&mut self, addr: Addr, modified: bool) -> Result<(), Error> {
		let now = self.clock.now();

		let Some(open) = self.open.get_mut(&addr) else {
			return Ok(());
		};
		if open.imp.doomed {
			return Ok(());
		}

		open.imp.refresh_node(&mut self.disk)?;
		let node_addr = open.imp.node_addr();
		let unlink =
			self.rankings
				.update_rank(&mut self.disk, node_addr, &mut open.imp.node, modified, now)?;

		if unlink == Unlink::Orphaned {
			warn!(%addr, "Couldn't move entry to the list head");
		}

		open.imp
			.info
			.set_times(open.imp.node.last_used, open.imp.node.last_modified);
		self.cursors.on_unlink(node_addr, unlink);

		Ok(())
	}

	// Entry lifecycle

	/// Allocates a record for `key` and links it into its chain and at the
	/// head of the list. The entry is left open with an internal reference.
	pub fn create_record(&mut self, key: &[u8], flags: u32) -> Result<Addr, Error> {
		let hash = key_hash(key);
		let now = self.clock.now();

		let this_id = self.this_id();
		let mut imp = EntryImpl::create(&mut self.disk, key, hash, flags, now, this_id)?;

		let bucket = self.disk.index.bucket_for(hash);
		imp.store.next = self.disk.index.bucket(bucket);
		imp.store(&mut self.disk)?;
		self.disk.index.set_bucket(bucket, imp.addr)?;

		let addr = imp.addr;
		let node_addr = imp.node_addr();
		self.rankings
			.insert(&mut self.disk, node_addr, &mut imp.node, true, now)?;

		let header = self.disk.header_mut();
		header.num_entries += 1;
		self.disk.store_header()?;
		self.publish_count();

		self.open.insert(addr, OpenEntry::new(imp));

		Ok(addr)
	}

	#[instrument(skip_all, fields(key = %String::from_utf8_lossy(key)))]
	pub fn create_entry(&mut self, key: &[u8]) -> Result<Entry, Error> {
		if self.find_entry(key)?.is_some() {
			self.stats.create_miss += 1;
			return Err(Error::AlreadyExists);
		}

		let addr = self.create_record(key, 0)?;
		let entry = self.user_handle(addr)?;
		self.release_internal(addr)?;

		self.stats.create_hit += 1;
		trace!(%addr, "Created entry");

		Ok(entry)
	}

	#[instrument(skip_all, fields(key = %String::from_utf8_lossy(key)))]
	pub fn open_entry(&mut self, key: &[u8]) -> Result<Entry, Error> {
		let Some(addr) = self.find_entry(key)? else {
			self.stats.open_miss += 1;
			return Err(Error::NotFound);
		};

		let entry = self.with_internal(addr, |this| {
			this.touch(addr, false)?;
			this.user_handle(addr)
		})?;

		self.stats.open_hit += 1;
		Ok(entry)
	}

	/// Marks the external hit as a use of the entry, if it exists.
	pub fn external_hit(&mut self, key: &[u8]) -> Result<(), Error> {
		let Some(addr) = self.find_entry(key)? else {
			return Ok(());
		};

		self.with_internal(addr, |this| this.touch(addr, false))
	}

	/// Takes an open entry out of the index, the list and the counters. Its
	/// storage is freed once it's closed.
	pub fn doom_open(&mut self, addr: Addr) -> Result<(), Error> {
		let open = self.open.get_mut(&addr).ok_or(Error::NotFound)?;
		if open.imp.doomed {
			return Ok(());
		}

		open.imp.refresh_node(&mut self.disk)?;
		let node_addr = open.imp.node_addr();
		let unlink = self
			.rankings
			.remove(&mut self.disk, node_addr, &mut open.imp.node)?;
		if unlink == Unlink::Orphaned {
			open.imp.orphaned = true;
		}

		let (hash, next) = (open.imp.store.hash, open.imp.store.next);
		let size = open.imp.total_size();
		let sparse_parent = open.imp.is_sparse_parent();

		self.cursors.on_unlink(node_addr, unlink);
		self.unlink_from_chain(addr, hash, next)?;

		if let Some(open) = self.open.get_mut(&addr) {
			open.imp.mark_doomed(&mut self.disk)?;
		}

		let header = self.disk.header_mut();
		header.num_entries = header.num_entries.saturating_sub(1);
		header.num_bytes = header.num_bytes.saturating_sub(size);
		self.disk.store_header()?;
		self.publish_count();

		trace!(%addr, "Doomed entry");

		if sparse_parent {
			self.doom_children(addr)?;
		}

		Ok(())
	}

	/// Dooms the entry behind a user handle.
	pub fn doom_handle(&mut self, addr: Addr) -> Result<(), Error> {
		let doomed = self.open.get(&addr).is_some_and(|open| open.imp.doomed);
		self.doom_open(addr)?;
		if !doomed {
			self.stats.doom_entry += 1;
		}
		Ok(())
	}

	#[instrument(skip_all, fields(key = %String::from_utf8_lossy(key)))]
	pub fn doom_key(&mut self, key: &[u8]) -> Result<(), Error> {
		let addr = self.find_entry(key)?.ok_or(Error::NotFound)?;
		self.with_internal(addr, |this| this.doom_open(addr))?;
		self.stats.doom_entry += 1;
		Ok(())
	}

	/// Dooms a listed entry, skipping it when its record is damaged.
	fn doom_listed(&mut self, addr: Addr) -> Result<bool, Error> {
		match self.with_internal(addr, |this| this.doom_open(addr)) {
			Ok(()) => Ok(true),
			Err(Error::Corrupted(reason)) => {
				warn!(%addr, %reason, "Skipping damaged entry");
				self.stats.invalid_entry += 1;
				Ok(false)
			}
			Err(e) => Err(e),
		}
	}

	#[instrument(skip(self))]
	pub fn doom_all(&mut self) -> Result<(), Error> {
		self.stats.doom_cache += 1;

		if self.open.is_empty() {
			return self.restart();
		}

		for (addr, _) in self.list_entries()? {
			self.doom_listed(addr)?;
		}

		Ok(())
	}

	/// Dooms entries last used in `[initial, end)`, no upper bound without
	/// `end`.
	#[instrument(skip(self))]
	pub fn doom_between(&mut self, initial: i64, end: Option<i64>) -> Result<(), Error> {
		let mut doomed = 0;

		for (addr, last_used) in self.list_entries()? {
			if last_used < initial {
				// Everything further down the list is older.
				break;
			}
			if end.is_some_and(|end| last_used >= end) {
				continue;
			}
			if self.doom_listed(addr)? {
				doomed += 1;
			}
		}

		self.stats.doom_recent += doomed;
		debug!(doomed, "Doomed recent entries");

		Ok(())
	}

	/// Records on the list with their last use, head first. The walk stops
	/// at the first damaged node.
	pub fn list_entries(&mut self) -> Result<Vec<(Addr, i64)>, Error> {
		let mut entries = Vec::new();
		let mut visited = HashSet::new();
		let mut current = None;

		loop {
			let next = match Rankings::next_of(&mut self.disk, current, Direction::Forward) {
				Ok(next) => next,
				Err(Error::Corrupted(reason)) => {
					warn!(%reason, "List walk stopped at a damaged node");
					break;
				}
				Err(e) => return Err(e),
			};

			let Some(node_addr) = next else {
				break;
			};
			if !visited.insert(node_addr) {
				warn!(%node_addr, "List loops back on itself");
				break;
			}

			match self.disk.load_node(node_addr) {
				Ok(node) => entries.push((node.contents, node.last_used)),
				Err(Error::Corrupted(reason)) => {
					warn!(%reason, "List walk stopped at a damaged node");
					break;
				}
				Err(e) => return Err(e),
			}

			current = Some(node_addr);
		}

		Ok(entries)
	}

	// Streams

	/// Largest size a single stream may reach.
	#[allow(clippy::cast_possible_truncation)]
	fn max_stream_size(&self) -> usize {
		(self.max_bytes / 8).min(u64::from(u32::MAX)) as usize
	}

	pub fn read_data(
		&mut self,
		addr: Addr,
		stream: usize,
		offset: usize,
		len: usize,
	) -> Result<Vec<u8>, Error> {
		let open = self.open.get(&addr).ok_or(Error::NotFound)?;
		if stream != 0 && open.imp.is_sparse_parent() {
			return Err(Error::NotSupported);
		}

		self.read_stream(addr, stream, offset, len)
	}

	pub fn write_data(
		&mut self,
		addr: Addr,
		stream: usize,
		offset: usize,
		data: &[u8],
		truncate: bool,
	) -> Result<usize, Error> {
		let open = self.open.get(&addr).ok_or(Error::NotFound)?;
		if stream != 0 && open.imp.is_sparse_parent() {
			return Err(Error::NotSupported);
		}

		self.write_stream(addr, stream, offset, data, truncate)
	}

	pub fn read_stream(
		&mut self,
		addr: Addr,
		stream: usize,
		offset: usize,
		len: usize,
	) -> Result<Vec<u8>, Error> {
		let open = self.open.get(&addr).ok_or(Error::NotFound)?;
		let buf = open.imp.read_data(&mut self.disk, stream, offset, len)?;
		self.touch(addr, false)?;

		Ok(buf)
	}

	pub fn write_stream(
		&mut self,
		addr: Addr,
		stream: usize,
		offset: usize,
		data: &[u8],
		truncate: bool,
	) -> Result<usize, Error> {
		let max_size = self.max_stream_size();
		let open = self.open.get_mut(&addr).ok_or(Error::NotFound)?;

		let grown = open
			.imp
			.write_data(&mut self.disk, stream, offset, data, truncate, max_size)?;
		if open.imp.doomed {
			return Ok(data.len());
		}

		let header = self.disk.header_mut();
		header.num_bytes = header.num_bytes.saturating_add_signed(grown);
		self.disk.store_header()?;

		self.touch(addr, true)?;
		if grown > 0 {
			self.trim_if_needed()?;
		}

		Ok(data.len())
	}

	// Backend wide

	pub fn set_max_size(&mut self, max_bytes: u64) -> Result<(), Error> {
		info!(max_bytes, "Changing cache size budget");
		self.max_bytes = max_bytes;
		self.trim_if_needed()
	}

	pub fn flush(&mut self) -> Result<(), Error> {
		self.disk.store_header()?;
		self.disk.index.sync()
	}

	pub fn stats_report(&self) -> Vec<(String, String)> {
		let header = self.disk.header();

		self.stats.report(Gauges {
			entries: header.num_entries,
			pending_io: self.tx.len(),
			max_bytes: self.max_bytes,
			num_bytes: header.num_bytes,
			open_entries: self
				.open
				.values()
				.filter(|open| open.user_generation.is_some())
				.count(),
		})
	}

	/// Clean shutdown: closes whatever is still open and clears the crash
	/// flag.
	#[instrument(skip(self), fields(open = self.open.len()))]
	pub fn shutdown(&mut self) -> Result<(), Error> {
		for (addr, mut open) in self.open.drain() {
			let res = if open.imp.doomed {
				open.imp.free_storage(&mut self.disk)
			} else {
				open.imp.set_dirty(&mut self.disk, 0)
			};

			if let Err(e) = res {
				error!(%addr, ?e, "Failed to close entry on shutdown");
			}
		}

		self.disk.header_mut().crash = false;
		self.disk.store_header()?;
		self.disk.index.sync()?;

		debug!("Cache closed cleanly");

		Ok(())
	}
}

fn open_disk(path: &Path) -> Result<Option<Disk>, Error> {
	if !path.join(INDEX_NAME).exists() {
		return Ok(None);
	}

	let index = IndexFile::open(path)?;
	let storage = Storage::init(path, false)?;

	Ok(Some(Disk { index, storage }))
}

fn create_disk(path: &Path, table_len: u32, now: i64) -> Result<Disk, Error> {
	let storage = Storage::init(path, true)?;
	let index = IndexFile::create(path, table_len, now)?;

	Ok(Disk { index, storage })
}

/// Removes the index, block files and external files, leaving anything
/// else in the directory alone.
fn delete_cache_files(path: &Path) -> Result<(), Error> {
	let read_dir = fs::read_dir(path)
		.map_err(|e| FileIOError::from((path, e, "Failed to read cache directory")))?;

	for dir_entry in read_dir {
		let dir_entry = dir_entry
			.map_err(|e| FileIOError::from((path, e, "Failed to read cache directory entry")))?;

		let name = dir_entry.file_name();
		let name = name.to_string_lossy();
		if name == INDEX_NAME || name.starts_with("data_") || name.starts_with("f_") {
			remove_file(&dir_entry.path())?;
		}
	}

	Ok(())
}
