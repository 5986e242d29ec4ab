use tokio::sync::oneshot;

use crate::{
	addr::Addr, completion::Ack, entry::Entry, rankings::Direction, sparse::AvailableRange,
};

pub(crate) type IteratorId = u64;

#[derive(Debug)]
pub(crate) enum Message {
	CreateEntry {
		key: Vec<u8>,
		ack: Ack<Entry>,
	},
	OpenEntry {
		key: Vec<u8>,
		ack: Ack<Entry>,
	},
	DoomEntry {
		key: Vec<u8>,
		ack: Ack<()>,
	},
	DoomAllEntries(Ack<()>),
	DoomEntriesBetween {
		initial: i64,
		end: Option<i64>,
		ack: Ack<()>,
	},
	OpenNextEntry {
		iterator: IteratorId,
		direction: Direction,
		ack: Ack<Option<Entry>>,
	},
	EndEnumeration(IteratorId),
	ExternalCacheHit(Vec<u8>),
	SetMaxSize {
		max_bytes: u64,
		ack: Ack<()>,
	},
	Stats(Ack<Vec<(String, String)>>),
	SelfCheck(Ack<u32>),
	Flush(Ack<()>),
	Entry {
		addr: Addr,
		op: EntryOp,
	},
	/// Sent by the worker to itself, runs the next step of the sparse
	/// operation in flight for the entry.
	ContinueSparse(Addr),
	ShutdownRequest(Option<oneshot::Sender<()>>),
}

impl Message {
	/// Entry level messages still run while the worker drains its queue on
	/// shutdown, the rest are dropped.
	pub(crate) const fn is_entry_level(&self) -> bool {
		matches!(self, Self::Entry { .. } | Self::ContinueSparse(_))
	}
}

#[derive(Debug)]
pub(crate) enum EntryOp {
	ReadData {
		stream: usize,
		offset: u32,
		len: usize,
		ack: Ack<Vec<u8>>,
	},
	WriteData {
		stream: usize,
		offset: u32,
		data: Vec<u8>,
		truncate: bool,
		ack: Ack<usize>,
	},
	ReadSparse {
		offset: u64,
		len: usize,
		ack: Ack<Vec<u8>>,
	},
	WriteSparse {
		offset: u64,
		data: Vec<u8>,
		ack: Ack<usize>,
	},
	AvailableRange {
		offset: u64,
		len: usize,
		ack: Ack<AvailableRange>,
	},
	Doom(Ack<()>),
	CancelSparse,
	ReadyForSparse(Ack<()>),
	/// The last clone of the handle created with `generation` is gone.
	Release {
		generation: u64,
	},
}
