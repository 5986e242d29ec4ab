//! Sparse IO driver.
//!
//! A sparse operation is split at child boundaries and the worker runs one
//! child per step, queueing the next step behind whatever else is pending.
//! Only one operation per parent is in flight at a time.

use std::ops::ControlFlow;

use tracing::{trace, warn};

use crate::{
	addr::Addr,
	completion::{reply, Ack},
	error::Error,
	format::{CHILD_ENTRY, PARENT_ENTRY},
	sparse::{
		child_key, AvailableRange, ChildHeader, ChildSpan, ParentHeader, SPARSE_DATA_STREAM,
		SPARSE_INDEX_STREAM,
	},
};

use super::{imp::BackendImpl, message::Message};

#[derive(Debug)]
pub(crate) struct SparseState {
	header: ParentHeader,
	op: Option<SparseOp>,
	waiters: Vec<Ack<()>>,
}

impl SparseState {
	const fn new(header: ParentHeader) -> Self {
		Self {
			header,
			op: None,
			waiters: Vec::new(),
		}
	}
}

#[derive(Debug)]
struct SparseOp {
	/// Absolute offset of the next byte to handle.
	pos: u64,
	remaining: usize,
	canceled: bool,
	kind: SparseKind,
}

#[derive(Debug)]
pub(crate) enum SparseKind {
	Read {
		out: Vec<u8>,
		ack: Ack<Vec<u8>>,
	},
	Write {
		data: Vec<u8>,
		written: usize,
		ack: Ack<usize>,
	},
	Range {
		query: u64,
		found: Option<AvailableRange>,
		ack: Ack<AvailableRange>,
	},
}

impl SparseKind {
	pub fn read(ack: Ack<Vec<u8>>) -> Self {
		Self::Read {
			out: Vec::new(),
			ack,
		}
	}

	pub const fn write(data: Vec<u8>, ack: Ack<usize>) -> Self {
		Self::Write {
			data,
			written: 0,
			ack,
		}
	}

	pub const fn range(query: u64, ack: Ack<AvailableRange>) -> Self {
		Self::Range {
			query,
			found: None,
			ack,
		}
	}

	/// Answers with the work done so far, or with `res`'s error.
	fn complete(self, res: Result<(), Error>) -> ControlFlow<()> {
		match self {
			Self::Read { out, ack } => reply(ack, res.map(|()| out)),
			Self::Write { written, ack, .. } => reply(ack, res.map(|()| written)),
			Self::Range { query, found, ack } => reply(
				ack,
				res.map(|()| {
					found.unwrap_or(AvailableRange {
						start: query,
						len: 0,
					})
				}),
			),
		}
	}
}

enum Step {
	Continue,
	Stop,
}

impl BackendImpl {
	/// Starts a sparse operation of `len` bytes at `offset` on an open entry,
	/// running its first step right away.
	pub fn start_sparse(
		&mut self,
		addr: Addr,
		offset: u64,
		len: usize,
		kind: SparseKind,
	) -> ControlFlow<()> {
		if let Err(e) = self.prepare_sparse(addr) {
			return kind.complete(Err(e));
		}

		let Some(open) = self.open.get_mut(&addr) else {
			return kind.complete(Err(Error::NotFound));
		};
		let Some(sparse) = open.sparse.as_mut() else {
			return kind.complete(Err(Error::NotSupported));
		};

		if sparse.op.is_some() {
			return kind.complete(Err(Error::SparseOperationInFlight));
		}

		sparse.op = Some(SparseOp {
			pos: offset,
			remaining: len,
			canceled: false,
			kind,
		});
		self.hold(addr);

		self.step_sparse(addr)
	}

	fn hold(&mut self, addr: Addr) {
		if let Some(open) = self.open.get_mut(&addr) {
			open.hold();
		}
	}

	/// Loads the sparse header of the entry, turning it into a parent on
	/// first use.
	fn prepare_sparse(&mut self, addr: Addr) -> Result<(), Error> {
		if !self.sparse_enabled {
			return Err(Error::NotSupported);
		}

		let open = self.open.get_mut(&addr).ok_or(Error::NotFound)?;
		if open.sparse.is_some() {
			return Ok(());
		}
		if open.imp.is_sparse_child() {
			return Err(Error::NotSupported);
		}

		if open.imp.is_sparse_parent() {
			let raw = open
				.imp
				.read_data(&mut self.disk, SPARSE_INDEX_STREAM, 0, usize::MAX)?;
			let header = ParentHeader::decode(&raw)
				.ok_or_else(|| Error::Corrupted(format!("damaged sparse header in entry {addr}")))?;
			open.sparse = Some(SparseState::new(header));

			return Ok(());
		}

		if open.imp.data_size(SPARSE_DATA_STREAM) != 0 || open.imp.data_size(SPARSE_INDEX_STREAM) != 0
		{
			return Err(Error::NotSupported);
		}

		let header = ParentHeader::new(rand::random());
		open.imp.store.flags |= PARENT_ENTRY;
		open.imp.store(&mut self.disk)?;
		trace!(%addr, signature = header.signature, "Entry became a sparse parent");

		self.write_stream(addr, SPARSE_INDEX_STREAM, 0, &header.encode(), true)?;

		if let Some(open) = self.open.get_mut(&addr) {
			open.sparse = Some(SparseState::new(header));
		}

		Ok(())
	}

	/// Runs the next child of the operation in flight for `addr`, then queues
	/// the following step or completes the operation.
	pub fn step_sparse(&mut self, addr: Addr) -> ControlFlow<()> {
		let Some(mut op) = self
			.open
			.get_mut(&addr)
			.and_then(|open| open.sparse.as_mut())
			.and_then(|sparse| sparse.op.take())
		else {
			trace!(%addr, "No sparse operation to continue");
			return ControlFlow::Continue(());
		};

		if op.remaining > 0 && !op.canceled {
			let span = ChildSpan::at(op.pos, op.remaining);

			match self.child_io(addr, span, &mut op.kind) {
				Ok(Step::Continue) => {
					op.pos += span.len as u64;
					op.remaining -= span.len;
				}
				Ok(Step::Stop) => op.remaining = 0,
				Err(e) => return self.finish_sparse(addr, op, Err(e)),
			}
		}

		if op.remaining == 0 || op.canceled {
			return self.finish_sparse(addr, op, Ok(()));
		}

		if let Some(sparse) = self
			.open
			.get_mut(&addr)
			.and_then(|open| open.sparse.as_mut())
		{
			sparse.op = Some(op);
		}

		if self.tx.try_send(Message::ContinueSparse(addr)).is_err() {
			self.deferred.push_back(addr);
		}

		ControlFlow::Continue(())
	}

	fn finish_sparse(
		&mut self,
		addr: Addr,
		op: SparseOp,
		res: Result<(), Error>,
	) -> ControlFlow<()> {
		trace!(%addr, canceled = op.canceled, ok = res.is_ok(), "Sparse operation done");

		if op.kind.complete(res).is_break() {
			return ControlFlow::Break(());
		}

		if let Some(sparse) = self
			.open
			.get_mut(&addr)
			.and_then(|open| open.sparse.as_mut())
		{
			for waiter in sparse.waiters.drain(..) {
				if waiter.send(Ok(())).is_err() {
					trace!(%addr, "Sparse readiness waiter went away");
				}
			}
		}

		match self.release_internal(addr) {
			Err(e) if e.is_fatal() => ControlFlow::Break(()),
			Err(e) => {
				warn!(%addr, ?e, "Failed to release entry after sparse operation");
				ControlFlow::Continue(())
			}
			Ok(()) => ControlFlow::Continue(()),
		}
	}

	pub fn cancel_sparse(&mut self, addr: Addr) {
		if let Some(op) = self
			.open
			.get_mut(&addr)
			.and_then(|open| open.sparse.as_mut())
			.and_then(|sparse| sparse.op.as_mut())
		{
			trace!(%addr, "Canceling sparse operation");
			op.canceled = true;
		}
	}

	pub fn ready_for_sparse(&mut self, addr: Addr, ack: Ack<()>) -> ControlFlow<()> {
		match self
			.open
			.get_mut(&addr)
			.and_then(|open| open.sparse.as_mut())
		{
			Some(sparse) if sparse.op.is_some() => {
				sparse.waiters.push(ack);
				ControlFlow::Continue(())
			}
			_ => reply(ack, Ok(())),
		}
	}

	/// Handles the part of the operation that falls in one child.
	fn child_io(&mut self, parent: Addr, span: ChildSpan, kind: &mut SparseKind) -> Result<Step, Error> {
		let child = self.find_child(parent, span.child)?;

		match kind {
			SparseKind::Read { out, .. } => {
				let Some(child) = child else {
					return Ok(Step::Stop);
				};

				let chunk = self.with_internal(child, |this| {
					let readable = this.child_header(child)?.readable_at(span.offset, span.len);
					if readable == 0 {
						return Ok(Vec::new());
					}
					this.read_stream(child, SPARSE_DATA_STREAM, span.offset, readable)
				})?;

				let short = chunk.len() < span.len;
				out.extend_from_slice(&chunk);

				Ok(if short { Step::Stop } else { Step::Continue })
			}

			SparseKind::Write { data, written, .. } => {
				let child = match child {
					Some(child) => child,
					None => self.create_child(parent, span.child)?,
				};

				let chunk = &data[*written..*written + span.len];
				self.with_internal(child, |this| {
					this.write_stream(child, SPARSE_DATA_STREAM, span.offset, chunk, false)?;

					let mut header = this.child_header(child)?;
					header.record_write(span.offset, span.len);
					this.write_stream(child, SPARSE_INDEX_STREAM, 0, &header.encode(), false)?;

					Ok(())
				})?;
				*written += span.len;

				Ok(Step::Continue)
			}

			SparseKind::Range { found, .. } => {
				let Some(child) = child else {
					return Ok(if found.is_some() { Step::Stop } else { Step::Continue });
				};

				let header = self.with_internal(child, |this| this.child_header(child))?;
				let span_end = span.offset + span.len;

				match found {
					None => {
						let Some((start, len)) = header.populated_run(span.offset, span_end) else {
							return Ok(Step::Continue);
						};

						*found = Some(AvailableRange {
							start: span.base() + start as u64,
							len,
						});

						Ok(if start + len == span_end { Step::Continue } else { Step::Stop })
					}
					Some(range) => {
						let len = header.readable_at(span.offset, span.len);
						range.len += len;

						Ok(if len == span.len { Step::Continue } else { Step::Stop })
					}
				}
			}
		}
	}

	fn parent_header(&self, parent: Addr) -> Result<&ParentHeader, Error> {
		self.open
			.get(&parent)
			.and_then(|open| open.sparse.as_ref())
			.map(|sparse| &sparse.header)
			.ok_or(Error::NotFound)
	}

	fn parent_key(&self, parent: Addr, child: u64) -> Result<(Vec<u8>, u64), Error> {
		let open = self.open.get(&parent).ok_or(Error::NotFound)?;
		let signature = self.parent_header(parent)?.signature;

		Ok((child_key(&open.imp.key, signature, child), signature))
	}

	/// The child entry for span `child`, if the parent knows about one whose
	/// header matches. Children that disappeared or don't belong to this
	/// parent are forgotten.
	fn find_child(&mut self, parent: Addr, child: u64) -> Result<Option<Addr>, Error> {
		let bit = usize::try_from(child).map_err(|_| Error::InvalidArgument("sparse offset out of range"))?;
		if !self.parent_header(parent)?.children.get(bit) {
			return Ok(None);
		}

		let (key, signature) = self.parent_key(parent, child)?;

		let Some(addr) = self.find_entry(&key)? else {
			warn!(%parent, child, "Sparse child is gone");
			self.set_child_bit(parent, bit, false)?;
			return Ok(None);
		};

		match self.with_internal(addr, |this| this.child_header(addr)) {
			Ok(header) if header.signature == signature => Ok(Some(addr)),
			Ok(_) | Err(Error::Corrupted(_)) => {
				warn!(%parent, child, %addr, "Dooming sparse child with a foreign header");
				self.with_internal(addr, |this| this.doom_open(addr))?;
				self.set_child_bit(parent, bit, false)?;
				Ok(None)
			}
			Err(e) => Err(e),
		}
	}

	fn create_child(&mut self, parent: Addr, child: u64) -> Result<Addr, Error> {
		let bit = usize::try_from(child).map_err(|_| Error::InvalidArgument("sparse offset out of range"))?;
		let (key, signature) = self.parent_key(parent, child)?;

		if let Some(stale) = self.find_entry(&key)? {
			warn!(%parent, child, %stale, "Replacing unreferenced sparse child");
			self.with_internal(stale, |this| this.doom_open(stale))?;
		}

		let addr = self.create_record(&key, CHILD_ENTRY)?;
		let res = self.write_stream(
			addr,
			SPARSE_INDEX_STREAM,
			0,
			&ChildHeader::new(signature).encode(),
			true,
		);
		if res.as_ref().is_err_and(Error::is_fatal) {
			return res.map(|_| addr);
		}
		self.release_internal(addr)?;
		res?;

		self.set_child_bit(parent, bit, true)?;
		trace!(%parent, child, %addr, "Created sparse child");

		Ok(addr)
	}

	fn child_header(&mut self, child: Addr) -> Result<ChildHeader, Error> {
		let open = self.open.get(&child).ok_or(Error::NotFound)?;
		let raw = open
			.imp
			.read_data(&mut self.disk, SPARSE_INDEX_STREAM, 0, usize::MAX)?;

		ChildHeader::decode(&raw)
			.ok_or_else(|| Error::Corrupted(format!("damaged sparse header in child {child}")))
	}

	fn set_child_bit(&mut self, parent: Addr, bit: usize, value: bool) -> Result<(), Error> {
		let encoded = {
			let Some(sparse) = self
				.open
				.get_mut(&parent)
				.and_then(|open| open.sparse.as_mut())
			else {
				return Err(Error::NotFound);
			};
			sparse.header.children.set(bit, value);
			sparse.header.encode()
		};

		self.write_stream(parent, SPARSE_INDEX_STREAM, 0, &encoded, true)
			.map(|_| ())
	}

	/// Dooms every child of a parent that was just doomed.
	pub fn doom_children(&mut self, parent: Addr) -> Result<(), Error> {
		let open = self.open.get(&parent).ok_or(Error::NotFound)?;

		let header = if let Some(sparse) = &open.sparse {
			sparse.header.clone()
		} else {
			let raw = open
				.imp
				.read_data(&mut self.disk, SPARSE_INDEX_STREAM, 0, usize::MAX)?;
			match ParentHeader::decode(&raw) {
				Some(header) => header,
				None => {
					warn!(%parent, "Doomed sparse parent has a damaged header, its children will be evicted");
					return Ok(());
				}
			}
		};
		let key = open.imp.key.clone();

		for child in header.children.ones() {
			let child_key = child_key(&key, header.signature, child as u64);
			if let Some(addr) = self.find_entry(&child_key)? {
				self.with_internal(addr, |this| this.doom_open(addr))?;
			}
		}

		Ok(())
	}
}
