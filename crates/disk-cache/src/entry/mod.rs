//! Entry handles.
//!
//! An [`Entry`] is a cheap, cloneable reference to one open cache entry. All
//! clones share the same state, and the backend only releases the entry once
//! the last of them is gone: flushing it when it is still live, or freeing
//! its storage when it was doomed in the meantime.
//!
//! Every data operation is queued on the backend worker at call time and
//! returns a [`Completion`]. Operations queued through a handle still run
//! after the handle is closed, in the order they were issued.

use std::{
	fmt,
	sync::{
		atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
		Arc, Weak,
	},
};

use async_channel as chan;
use chrono::{DateTime, Utc};
use tracing::trace;

use crate::{
	addr::Addr,
	backend::message::{EntryOp, Message},
	completion::{Ack, Completion},
	error::Error,
	format::NUM_STREAMS,
	sparse::{AvailableRange, MAX_SPARSE_OFFSET},
};

pub(crate) mod imp;

/// State of an entry visible without a round trip to the worker, which keeps
/// it current before completing each operation.
#[derive(Debug)]
pub(crate) struct EntryInfo {
	key: Box<[u8]>,
	last_used: AtomicI64,
	last_modified: AtomicI64,
	data_sizes: [AtomicU32; NUM_STREAMS],
	doomed: AtomicBool,
}

impl EntryInfo {
	pub(crate) fn new(key: &[u8]) -> Self {
		Self {
			key: key.into(),
			last_used: AtomicI64::new(0),
			last_modified: AtomicI64::new(0),
			data_sizes: Default::default(),
			doomed: AtomicBool::new(false),
		}
	}

	pub(crate) fn set_times(&self, last_used: i64, last_modified: i64) {
		self.last_used.store(last_used, Ordering::Release);
		self.last_modified.store(last_modified, Ordering::Release);
	}

	pub(crate) fn set_data_size(&self, stream: usize, size: u32) {
		self.data_sizes[stream].store(size, Ordering::Release);
	}

	pub(crate) fn set_doomed(&self) {
		self.doomed.store(true, Ordering::Release);
	}
}

/// Shared by every clone of one handle; dropping the last clone releases the
/// entry on the worker.
pub(crate) struct EntryShared {
	addr: Addr,
	generation: u64,
	info: Arc<EntryInfo>,
	tx: chan::Sender<Message>,
}

impl Drop for EntryShared {
	fn drop(&mut self) {
		let release = Message::Entry {
			addr: self.addr,
			op: EntryOp::Release {
				generation: self.generation,
			},
		};

		if self.tx.try_send(release).is_err() {
			trace!(addr = %self.addr, "Backend already shutdown, nothing to release");
		}
	}
}

/// Handle to an open cache entry.
#[derive(Clone)]
pub struct Entry {
	shared: Arc<EntryShared>,
}

impl Entry {
	pub(crate) fn new(
		addr: Addr,
		generation: u64,
		info: Arc<EntryInfo>,
		tx: chan::Sender<Message>,
	) -> Self {
		Self {
			shared: Arc::new(EntryShared {
				addr,
				generation,
				info,
				tx,
			}),
		}
	}

	pub(crate) fn downgrade(&self) -> Weak<EntryShared> {
		Arc::downgrade(&self.shared)
	}

	pub(crate) fn upgrade(weak: &Weak<EntryShared>) -> Option<Self> {
		weak.upgrade().map(|shared| Self { shared })
	}

	fn send<T>(&self, op: impl FnOnce(Ack<T>) -> EntryOp) -> Completion<T> {
		let addr = self.shared.addr;
		Completion::send(&self.shared.tx, |ack| Message::Entry { addr, op: op(ack) })
	}

	#[must_use]
	pub fn key(&self) -> &[u8] {
		&self.shared.info.key
	}

	#[must_use]
	pub fn last_used(&self) -> DateTime<Utc> {
		from_micros(self.shared.info.last_used.load(Ordering::Acquire))
	}

	#[must_use]
	pub fn last_modified(&self) -> DateTime<Utc> {
		from_micros(self.shared.info.last_modified.load(Ordering::Acquire))
	}

	/// Length of `stream`, zero for streams out of range.
	#[must_use]
	pub fn data_size(&self, stream: usize) -> u32 {
		self.shared
			.info
			.data_sizes
			.get(stream)
			.map_or(0, |size| size.load(Ordering::Acquire))
	}

	#[must_use]
	pub fn is_doomed(&self) -> bool {
		self.shared.info.doomed.load(Ordering::Acquire)
	}

	/// Reads up to `len` bytes of `stream` starting at `offset`. Reads past the
	/// end of the stream return what is there, possibly nothing.
	pub fn read_data(&self, stream: usize, offset: u64, len: usize) -> Completion<Vec<u8>> {
		let offset = match check_stream_io(stream, offset, len) {
			Ok(offset) => offset,
			Err(e) => return Completion::rejected(e),
		};

		self.send(|ack| EntryOp::ReadData {
			stream,
			offset,
			len,
			ack,
		})
	}

	/// Writes `data` into `stream` at `offset`, returning the bytes written.
	///
	/// Writing past the end zero fills the gap. With `truncate` the stream
	/// ends right after the written bytes, otherwise a longer stream keeps its
	/// tail.
	pub fn write_data(
		&self,
		stream: usize,
		offset: u64,
		data: impl Into<Vec<u8>>,
		truncate: bool,
	) -> Completion<usize> {
		let data = data.into();
		let offset = match check_stream_io(stream, offset, data.len()) {
			Ok(offset) => offset,
			Err(e) => return Completion::rejected(e),
		};

		self.send(|ack| EntryOp::WriteData {
			stream,
			offset,
			data,
			truncate,
			ack,
		})
	}

	/// Reads the sparse payload at `offset`, stopping at the first byte that
	/// was never written.
	pub fn read_sparse_data(&self, offset: u64, len: usize) -> Completion<Vec<u8>> {
		if let Err(e) = check_sparse_io(offset, len) {
			return Completion::rejected(e);
		}

		self.send(|ack| EntryOp::ReadSparse { offset, len, ack })
	}

	pub fn write_sparse_data(&self, offset: u64, data: impl Into<Vec<u8>>) -> Completion<usize> {
		let data = data.into();
		if let Err(e) = check_sparse_io(offset, data.len()) {
			return Completion::rejected(e);
		}

		self.send(|ack| EntryOp::WriteSparse { offset, data, ack })
	}

	/// Finds the first run of written bytes inside `[offset, offset + len)`.
	pub fn get_available_range(&self, offset: u64, len: usize) -> Completion<AvailableRange> {
		if let Err(e) = check_sparse_io(offset, len) {
			return Completion::rejected(e);
		}

		self.send(|ack| EntryOp::AvailableRange { offset, len, ack })
	}

	/// Removes the entry from the cache. Open handles keep working, the
	/// storage goes away with the last of them.
	pub fn doom(&self) -> Completion<()> {
		self.send(EntryOp::Doom)
	}

	/// Asks the sparse operation in flight to stop at the next child boundary.
	pub fn cancel_sparse_io(&self) {
		let addr = self.shared.addr;
		if self
			.shared
			.tx
			.try_send(Message::Entry {
				addr,
				op: EntryOp::CancelSparse,
			})
			.is_err()
		{
			trace!(%addr, "Backend already shutdown, nothing to cancel");
		}
	}

	/// Resolves once no sparse operation is in flight for this entry.
	pub fn ready_for_sparse_io(&self) -> Completion<()> {
		self.send(EntryOp::ReadyForSparse)
	}

	/// Releases this handle. Operations already issued through it still run.
	pub fn close(self) {}
}

impl PartialEq for Entry {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.shared, &other.shared)
	}
}

impl Eq for Entry {}

impl fmt::Debug for Entry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Entry")
			.field("addr", &self.shared.addr)
			.field("key", &String::from_utf8_lossy(&self.shared.info.key))
			.field("doomed", &self.is_doomed())
			.finish_non_exhaustive()
	}
}

pub(crate) fn from_micros(micros: i64) -> DateTime<Utc> {
	DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn check_stream_io(stream: usize, offset: u64, len: usize) -> Result<u32, Error> {
	if stream >= NUM_STREAMS {
		return Err(Error::InvalidArgument("stream index out of range"));
	}

	let offset = u32::try_from(offset).map_err(|_| Error::InvalidArgument("offset out of range"))?;
	if u32::try_from(len)
		.ok()
		.and_then(|len| offset.checked_add(len))
		.is_none()
	{
		return Err(Error::InvalidArgument("length out of range"));
	}

	Ok(offset)
}

fn check_sparse_io(offset: u64, len: usize) -> Result<(), Error> {
	if offset
		.checked_add(len as u64)
		.map_or(true, |end| end > MAX_SPARSE_OFFSET)
	{
		return Err(Error::InvalidArgument("sparse range out of bounds"));
	}

	Ok(())
}
