//! Persisted record layouts.
//!
//! Everything on disk is little endian with fixed offsets, so a record can be
//! rewritten in place without touching its neighbours. Records that are read
//! back during recovery carry a checksum to detect torn writes.

use crate::{addr::Addr, hash::checksum};

pub const INDEX_MAGIC: u32 = 0xc103_cac3;
pub const BLOCK_MAGIC: u32 = 0xc104_cac3;
pub const CURRENT_VERSION: u32 = 0x0002_0001;

pub const INDEX_HEADER_SIZE: usize = 256;
pub const BLOCK_HEADER_SIZE: usize = 8192;
const BLOCK_HEADER_FIELDS_SIZE: usize = 80;
pub const ALLOCATION_MAP_WORDS: usize = (BLOCK_HEADER_SIZE - BLOCK_HEADER_FIELDS_SIZE) / 4;
/// Max blocks a single block file can hold.
pub const MAX_BLOCKS: usize = ALLOCATION_MAP_WORDS * 32;

pub const RANKINGS_NODE_SIZE: usize = 36;
pub const ENTRY_BLOCK_SIZE: usize = 256;
const ENTRY_HEADER_SIZE: usize = 96;
/// Longest key that still fits inside a 4 blocks entry record.
pub const MAX_INLINE_KEY_LEN: usize = ENTRY_BLOCK_SIZE * 4 - ENTRY_HEADER_SIZE - 1;

/// User visible streams per entry; the extra slot on disk is reserved.
pub const NUM_STREAMS: usize = 3;
const STORED_STREAMS: usize = 4;

/// Minimal little endian writer, records are small and fixed so we never need
/// anything fancier.
struct Encoder {
	buf: Vec<u8>,
}

impl Encoder {
	fn with_len(len: usize) -> Self {
		Self {
			buf: Vec::with_capacity(len),
		}
	}

	fn u16(&mut self, value: u16) -> &mut Self {
		self.buf.extend_from_slice(&value.to_le_bytes());
		self
	}

	fn u32(&mut self, value: u32) -> &mut Self {
		self.buf.extend_from_slice(&value.to_le_bytes());
		self
	}

	fn u64(&mut self, value: u64) -> &mut Self {
		self.buf.extend_from_slice(&value.to_le_bytes());
		self
	}

	fn i64(&mut self, value: i64) -> &mut Self {
		self.buf.extend_from_slice(&value.to_le_bytes());
		self
	}

	fn addr(&mut self, addr: Addr) -> &mut Self {
		self.u32(addr.value())
	}

	fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
		self.buf.extend_from_slice(bytes);
		self
	}

	fn finish(mut self, len: usize) -> Vec<u8> {
		self.buf.resize(len, 0);
		self.buf
	}
}

/// Reader counterpart of [`Encoder`], reading past the end yields zeros so a
/// short buffer decodes as an obviously invalid record instead of panicking.
struct Decoder<'buf> {
	buf: &'buf [u8],
	pos: usize,
}

impl<'buf> Decoder<'buf> {
	const fn new(buf: &'buf [u8]) -> Self {
		Self { buf, pos: 0 }
	}

	fn take<const N: usize>(&mut self) -> [u8; N] {
		let mut out = [0; N];
		if let Some(slice) = self.buf.get(self.pos..self.pos + N) {
			out.copy_from_slice(slice);
		}
		self.pos += N;
		out
	}

	fn u16(&mut self) -> u16 {
		u16::from_le_bytes(self.take())
	}

	fn u32(&mut self) -> u32 {
		u32::from_le_bytes(self.take())
	}

	fn u64(&mut self) -> u64 {
		u64::from_le_bytes(self.take())
	}

	fn i64(&mut self) -> i64 {
		i64::from_le_bytes(self.take())
	}

	fn addr(&mut self) -> Addr {
		Addr::from_value(self.u32())
	}

	fn skip(&mut self, len: usize) -> &mut Self {
		self.pos += len;
		self
	}
}

/// Checksums `buf` as if the 4 bytes at `slot` were zero.
fn checksum_without_slot(buf: &[u8], slot: usize) -> u32 {
	let mut copy = buf.to_vec();
	copy[slot..slot + 4].fill(0);
	checksum(&copy)
}

/// Which rankings list mutation was in progress when the header was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum Operation {
	#[default]
	None = 0,
	Insert = 1,
	Remove = 2,
}

impl Operation {
	const fn from_u32(value: u32) -> Self {
		match value {
			1 => Self::Insert,
			2 => Self::Remove,
			_ => Self::None,
		}
	}
}

/// Persisted state of the LRU list, lives inside the index header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LruData {
	pub head: Addr,
	pub tail: Addr,
	/// Node being inserted or removed, `NULL` when nothing is in progress.
	pub transaction: Addr,
	pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHeader {
	pub magic: u32,
	pub version: u32,
	pub num_entries: u32,
	pub num_bytes: u64,
	/// Last external file number handed out.
	pub last_file: u32,
	/// Session generation, bumped on every open and never zero.
	pub this_id: u32,
	pub table_len: u32,
	/// Set while a backend has the directory open.
	pub crash: bool,
	pub create_time: i64,
	pub lru: LruData,
}

impl IndexHeader {
	#[must_use]
	pub const fn new(table_len: u32, create_time: i64) -> Self {
		Self {
			magic: INDEX_MAGIC,
			version: CURRENT_VERSION,
			num_entries: 0,
			num_bytes: 0,
			last_file: 0,
			this_id: 1,
			table_len,
			crash: false,
			create_time,
			lru: LruData {
				head: Addr::NULL,
				tail: Addr::NULL,
				transaction: Addr::NULL,
				operation: Operation::None,
			},
		}
	}

	#[must_use]
	pub fn encode(&self) -> Vec<u8> {
		let mut enc = Encoder::with_len(INDEX_HEADER_SIZE);
		enc.u32(self.magic)
			.u32(self.version)
			.u32(self.num_entries)
			.u64(self.num_bytes)
			.u32(self.last_file)
			.u32(self.this_id)
			.u32(self.table_len)
			.u32(u32::from(self.crash))
			.i64(self.create_time)
			.addr(self.lru.head)
			.addr(self.lru.tail)
			.addr(self.lru.transaction)
			.u32(self.lru.operation as u32);
		enc.finish(INDEX_HEADER_SIZE)
	}

	#[must_use]
	pub fn decode(buf: &[u8]) -> Self {
		let mut dec = Decoder::new(buf);
		Self {
			magic: dec.u32(),
			version: dec.u32(),
			num_entries: dec.u32(),
			num_bytes: dec.u64(),
			last_file: dec.u32(),
			this_id: dec.u32(),
			table_len: dec.u32(),
			crash: dec.u32() != 0,
			create_time: dec.i64(),
			lru: LruData {
				head: dec.addr(),
				tail: dec.addr(),
				transaction: dec.addr(),
				operation: Operation::from_u32(dec.u32()),
			},
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFileHeader {
	pub magic: u32,
	pub version: u32,
	pub this_file: u16,
	pub next_file: u16,
	pub entry_size: u32,
	/// Number of records (not blocks) currently allocated.
	pub num_entries: u32,
	/// Blocks the file currently has room for.
	pub max_entries: u32,
	/// Count of free runs of each length (1 to 4 blocks).
	pub empty: [u32; 4],
	/// Last map word used for each run length.
	pub hints: [u32; 4],
	/// Non zero while the allocation map is being modified.
	pub updating: u32,
	pub allocation_map: Vec<u32>,
}

impl BlockFileHeader {
	#[must_use]
	pub fn new(this_file: u16, entry_size: usize) -> Self {
		Self {
			magic: BLOCK_MAGIC,
			version: CURRENT_VERSION,
			this_file,
			next_file: 0,
			#[allow(clippy::cast_possible_truncation)]
			entry_size: entry_size as u32,
			num_entries: 0,
			max_entries: 0,
			empty: [0; 4],
			hints: [0; 4],
			updating: 0,
			allocation_map: vec![0; ALLOCATION_MAP_WORDS],
		}
	}

	/// Only the fixed fields, used when the map itself didn't change.
	#[must_use]
	pub fn encode_fields(&self) -> Vec<u8> {
		let mut enc = Encoder::with_len(BLOCK_HEADER_FIELDS_SIZE);
		enc.u32(self.magic)
			.u32(self.version)
			.u16(self.this_file)
			.u16(self.next_file)
			.u32(self.entry_size)
			.u32(self.num_entries)
			.u32(self.max_entries);
		for empty in self.empty {
			enc.u32(empty);
		}
		for hint in self.hints {
			enc.u32(hint);
		}
		enc.u32(self.updating);
		enc.finish(BLOCK_HEADER_FIELDS_SIZE)
	}

	#[must_use]
	pub fn encode(&self) -> Vec<u8> {
		let mut enc = Encoder::with_len(BLOCK_HEADER_SIZE);
		enc.bytes(&self.encode_fields());
		for word in &self.allocation_map {
			enc.u32(*word);
		}
		enc.finish(BLOCK_HEADER_SIZE)
	}

	/// File offset of a single allocation map word.
	#[must_use]
	pub const fn map_word_offset(word: usize) -> u64 {
		(BLOCK_HEADER_FIELDS_SIZE + word * 4) as u64
	}

	#[must_use]
	pub fn decode(buf: &[u8]) -> Self {
		let mut dec = Decoder::new(buf);
		let magic = dec.u32();
		let version = dec.u32();
		let this_file = dec.u16();
		let next_file = dec.u16();
		let entry_size = dec.u32();
		let num_entries = dec.u32();
		let max_entries = dec.u32();
		let empty = [dec.u32(), dec.u32(), dec.u32(), dec.u32()];
		let hints = [dec.u32(), dec.u32(), dec.u32(), dec.u32()];
		let updating = dec.u32();
		dec.skip(BLOCK_HEADER_FIELDS_SIZE - 60);

		Self {
			magic,
			version,
			this_file,
			next_file,
			entry_size,
			num_entries,
			max_entries,
			empty,
			hints,
			updating,
			allocation_map: (0..ALLOCATION_MAP_WORDS).map(|_| dec.u32()).collect(),
		}
	}
}

/// One link of the LRU list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RankingsNode {
	/// Microseconds since the unix epoch.
	pub last_used: i64,
	pub last_modified: i64,
	/// Towards the tail, the tail points to itself.
	pub next: Addr,
	/// Towards the head, the head points to itself.
	pub prev: Addr,
	/// The entry record this node ranks.
	pub contents: Addr,
	/// Session id of the backend that has the entry open, zero once closed.
	pub dirty: u32,
}

impl RankingsNode {
	const HASH_SLOT: usize = 32;

	#[must_use]
	pub fn encode(&self) -> Vec<u8> {
		let mut enc = Encoder::with_len(RANKINGS_NODE_SIZE);
		enc.i64(self.last_used)
			.i64(self.last_modified)
			.addr(self.next)
			.addr(self.prev)
			.addr(self.contents)
			.u32(self.dirty)
			.u32(0);
		let mut buf = enc.finish(RANKINGS_NODE_SIZE);
		let hash = checksum(&buf);
		buf[Self::HASH_SLOT..Self::HASH_SLOT + 4].copy_from_slice(&hash.to_le_bytes());
		buf
	}

	/// Returns `None` for a torn or never written node.
	#[must_use]
	pub fn decode(buf: &[u8]) -> Option<Self> {
		if buf.len() < RANKINGS_NODE_SIZE {
			return None;
		}
		let buf = &buf[..RANKINGS_NODE_SIZE];

		let mut dec = Decoder::new(buf);
		let node = Self {
			last_used: dec.i64(),
			last_modified: dec.i64(),
			next: dec.addr(),
			prev: dec.addr(),
			contents: dec.addr(),
			dirty: dec.u32(),
		};

		(dec.u32() == checksum_without_slot(buf, Self::HASH_SLOT)).then_some(node)
	}

	/// Nodes out of the list have both links cleared.
	#[must_use]
	pub const fn is_linked(&self) -> bool {
		self.next.is_initialized() && self.prev.is_initialized()
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum EntryState {
	#[default]
	Normal = 0,
	Evicted = 1,
	Doomed = 2,
}

impl EntryState {
	const fn from_u32(value: u32) -> Option<Self> {
		match value {
			0 => Some(Self::Normal),
			1 => Some(Self::Evicted),
			2 => Some(Self::Doomed),
			_ => None,
		}
	}
}

/// Entry flags.
pub const PARENT_ENTRY: u32 = 1 << 0;
pub const CHILD_ENTRY: u32 = 1 << 1;

/// Persisted metadata for one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryStore {
	pub hash: u32,
	/// Next record in the same hash bucket.
	pub next: Addr,
	pub rankings_node: Addr,
	pub reuse_count: u32,
	pub refetch_count: u32,
	pub state: EntryState,
	pub creation_time: i64,
	pub key_len: u32,
	/// Where the key lives when it doesn't fit inline.
	pub long_key: Addr,
	pub data_size: [u32; STORED_STREAMS],
	pub data_addr: [Addr; STORED_STREAMS],
	pub flags: u32,
	/// Inline key bytes, empty when `long_key` is used.
	pub key: Vec<u8>,
}

impl EntryStore {
	const HASH_SLOT: usize = 92;

	/// Blocks needed to store a record holding a key of `key_len` bytes.
	#[must_use]
	pub const fn blocks_for_key(key_len: usize) -> usize {
		if key_len > MAX_INLINE_KEY_LEN {
			1
		} else {
			(ENTRY_HEADER_SIZE + key_len + 1).div_ceil(ENTRY_BLOCK_SIZE)
		}
	}

	#[must_use]
	pub const fn key_is_inline(key_len: usize) -> bool {
		key_len <= MAX_INLINE_KEY_LEN
	}

	#[must_use]
	pub fn encode(&self, num_blocks: usize) -> Vec<u8> {
		let len = num_blocks * ENTRY_BLOCK_SIZE;

		let mut enc = Encoder::with_len(len);
		enc.u32(self.hash)
			.addr(self.next)
			.addr(self.rankings_node)
			.u32(self.reuse_count)
			.u32(self.refetch_count)
			.u32(self.state as u32)
			.i64(self.creation_time)
			.u32(self.key_len)
			.addr(self.long_key);
		for size in self.data_size {
			enc.u32(size);
		}
		for addr in self.data_addr {
			enc.addr(addr);
		}
		enc.u32(self.flags)
			// reserved
			.u32(0)
			.u32(0)
			.u32(0)
			.u32(0)
			// checksum slot
			.u32(0)
			.bytes(&self.key);

		let mut buf = enc.finish(len);
		let hash = checksum(&buf);
		buf[Self::HASH_SLOT..Self::HASH_SLOT + 4].copy_from_slice(&hash.to_le_bytes());
		buf
	}

	/// Returns `None` if the checksum doesn't match or the fields are out of
	/// range.
	#[must_use]
	pub fn decode(buf: &[u8]) -> Option<Self> {
		if buf.len() < ENTRY_BLOCK_SIZE {
			return None;
		}

		let mut dec = Decoder::new(buf);
		let hash = dec.u32();
		let next = dec.addr();
		let rankings_node = dec.addr();
		let reuse_count = dec.u32();
		let refetch_count = dec.u32();
		let state = EntryState::from_u32(dec.u32())?;
		let creation_time = dec.i64();
		let key_len = dec.u32();
		let long_key = dec.addr();
		let data_size = [dec.u32(), dec.u32(), dec.u32(), dec.u32()];
		let data_addr = [dec.addr(), dec.addr(), dec.addr(), dec.addr()];
		let flags = dec.u32();
		dec.skip(16);
		let stored_hash = dec.u32();

		if stored_hash != checksum_without_slot(buf, Self::HASH_SLOT) {
			return None;
		}

		let key_len_usize = key_len as usize;
		let key = if Self::key_is_inline(key_len_usize) {
			buf.get(ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + key_len_usize)?
				.to_vec()
		} else {
			Vec::new()
		};

		Some(Self {
			hash,
			next,
			rankings_node,
			reuse_count,
			refetch_count,
			state,
			creation_time,
			key_len,
			long_key,
			data_size,
			data_addr,
			flags,
			key,
		})
	}

	/// Every address stored in the record passes a structural check.
	#[must_use]
	pub fn addrs_look_sane(&self) -> bool {
		self.next.sanity_check()
			&& self.rankings_node.sanity_check()
			&& self.long_key.sanity_check()
			&& self.data_addr.iter().all(|addr| addr.sanity_check())
	}
}
