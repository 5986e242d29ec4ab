//! Layout of sparse entries.
//!
//! A sparse entry addresses its payload by absolute offsets. The address space
//! is cut into 1 MiB spans and every span that was ever written is stored in
//! its own child entry, so children are cached and evicted like any other
//! entry. The parent keeps a bitmap of the children it created in stream 2.
//!
//! Inside a child, data lives in stream 1 at the offset relative to the span,
//! and stream 2 holds a bitmap of the 1 KiB blocks that were written. Writes
//! that end in the middle of a block are remembered separately, so a series of
//! unaligned sequential writes still reads back without holes.

/// Stream holding child data.
pub const SPARSE_DATA_STREAM: usize = 1;
/// Stream holding the sparse headers, for parents and children alike.
pub const SPARSE_INDEX_STREAM: usize = 2;

/// Bytes covered by one child entry.
pub const CHILD_SPAN: u64 = 1 << 20;
/// Granularity of the child block bitmap.
pub const SPARSE_BLOCK: usize = 1024;
const BLOCKS_PER_CHILD: usize = (CHILD_SPAN as usize) / SPARSE_BLOCK;

/// Every child key starts with this.
pub const CHILD_KEY_PREFIX: &[u8] = b"Range_";

/// Offsets at or beyond this are not supported.
pub const MAX_SPARSE_OFFSET: u64 = 0x10_0000_0000;

const PARENT_MAGIC: u32 = 0xeade_0001;
const CHILD_MAGIC: u32 = 0xeade_0002;
const PARENT_HEADER_SIZE: usize = 16;
const CHILD_HEADER_SIZE: usize = 24;

/// The populated range found by a range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AvailableRange {
	/// First populated byte, or the query offset when nothing was found.
	pub start: u64,
	/// Number of contiguous populated bytes from `start`.
	pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitmap(Vec<u8>);

impl Bitmap {
	#[must_use]
	pub fn with_bits(bits: usize) -> Self {
		Self(vec![0; bits.div_ceil(8)])
	}

	#[must_use]
	pub fn get(&self, bit: usize) -> bool {
		self.0
			.get(bit / 8)
			.is_some_and(|byte| byte & (1 << (bit % 8)) != 0)
	}

	/// Sets or clears `bit`, growing the map when needed.
	pub fn set(&mut self, bit: usize, value: bool) {
		let byte = bit / 8;
		if byte >= self.0.len() {
			if !value {
				return;
			}
			self.0.resize(byte + 1, 0);
		}

		if value {
			self.0[byte] |= 1 << (bit % 8);
		} else {
			self.0[byte] &= !(1 << (bit % 8));
		}
	}

	pub fn set_range(&mut self, start: usize, end: usize) {
		for bit in start..end {
			self.set(bit, true);
		}
	}

	/// Indexes of every set bit.
	pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
		(0..self.0.len() * 8).filter(|&bit| self.get(bit))
	}

	#[must_use]
	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}
}

/// Sparse header of a parent entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentHeader {
	/// Random value embedded in child keys, so a parent that was doomed and
	/// recreated never picks up the children of its predecessor.
	pub signature: u64,
	pub children: Bitmap,
}

impl ParentHeader {
	#[must_use]
	pub fn new(signature: u64) -> Self {
		Self {
			signature,
			children: Bitmap::default(),
		}
	}

	#[must_use]
	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(PARENT_HEADER_SIZE + self.children.as_bytes().len());
		buf.extend_from_slice(&self.signature.to_le_bytes());
		buf.extend_from_slice(&PARENT_MAGIC.to_le_bytes());
		buf.extend_from_slice(&0_u32.to_le_bytes());
		buf.extend_from_slice(self.children.as_bytes());
		buf
	}

	#[must_use]
	pub fn decode(buf: &[u8]) -> Option<Self> {
		let (signature, magic) = decode_prefix(buf)?;

		(magic == PARENT_MAGIC).then(|| Self {
			signature,
			children: Bitmap(buf[PARENT_HEADER_SIZE..].to_vec()),
		})
	}
}

/// Sparse header of a child entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildHeader {
	pub signature: u64,
	/// Block holding a write that stopped before the block end.
	pub last_block: Option<usize>,
	/// How many bytes of `last_block` are populated.
	pub last_block_len: usize,
	pub blocks: Bitmap,
}

impl ChildHeader {
	#[must_use]
	pub fn new(signature: u64) -> Self {
		Self {
			signature,
			last_block: None,
			last_block_len: 0,
			blocks: Bitmap::with_bits(BLOCKS_PER_CHILD),
		}
	}

	#[must_use]
	#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
	pub fn encode(&self) -> Vec<u8> {
		let last_block = self.last_block.map_or(-1, |block| block as i32);

		let mut buf = Vec::with_capacity(CHILD_HEADER_SIZE + BLOCKS_PER_CHILD / 8);
		buf.extend_from_slice(&self.signature.to_le_bytes());
		buf.extend_from_slice(&CHILD_MAGIC.to_le_bytes());
		buf.extend_from_slice(&last_block.to_le_bytes());
		buf.extend_from_slice(&(self.last_block_len as u32).to_le_bytes());
		buf.extend_from_slice(&0_u32.to_le_bytes());

		let mut blocks = self.blocks.as_bytes().to_vec();
		blocks.resize(BLOCKS_PER_CHILD / 8, 0);
		buf.extend_from_slice(&blocks);
		buf
	}

	#[must_use]
	pub fn decode(buf: &[u8]) -> Option<Self> {
		let (signature, magic) = decode_prefix(buf)?;
		if magic != CHILD_MAGIC || buf.len() < CHILD_HEADER_SIZE + BLOCKS_PER_CHILD / 8 {
			return None;
		}

		let last_block = i32::from_le_bytes(buf[12..16].try_into().ok()?);
		let last_block_len = u32::from_le_bytes(buf[16..20].try_into().ok()?) as usize;
		if last_block_len >= SPARSE_BLOCK {
			return None;
		}

		Some(Self {
			signature,
			last_block: usize::try_from(last_block)
				.ok()
				.filter(|&block| block < BLOCKS_PER_CHILD),
			last_block_len,
			blocks: Bitmap(buf[CHILD_HEADER_SIZE..CHILD_HEADER_SIZE + BLOCKS_PER_CHILD / 8].to_vec()),
		})
	}

	/// Records that `len` bytes were written at `offset` inside the child.
	///
	/// Only whole blocks make it to the bitmap. A write starting mid block
	/// counts from the next block, unless it continues exactly where the
	/// remembered partial block stops. A write ending mid block leaves that
	/// block as the partial one.
	pub fn record_write(&mut self, offset: usize, len: usize) {
		if len == 0 {
			return;
		}

		let mut first = offset / SPARSE_BLOCK;
		let first_offset = offset % SPARSE_BLOCK;
		if first_offset != 0
			&& (self.last_block != Some(first) || self.last_block_len < first_offset)
		{
			first += 1;
		}

		let end = offset + len;
		let last = end / SPARSE_BLOCK;
		let last_offset = end % SPARSE_BLOCK;

		// Starts mid block without following the last write, and ends in that
		// same block.
		if first > last {
			return;
		}

		if last_offset != 0 && !self.blocks.get(last) {
			self.last_block = Some(last);
			self.last_block_len = last_offset;
		} else {
			self.last_block = None;
			self.last_block_len = 0;
		}

		self.blocks.set_range(first, last);
	}

	/// First run of populated bytes inside `[from, to)`, as `(start, len)`.
	#[must_use]
	pub fn populated_run(&self, from: usize, to: usize) -> Option<(usize, usize)> {
		let mut start = None;
		let mut pos = from;

		while pos < to {
			let block = pos / SPARSE_BLOCK;
			let block_start = block * SPARSE_BLOCK;
			let block_end = (block_start + SPARSE_BLOCK).min(to);

			let filled_end = if self.blocks.get(block) {
				block_end
			} else if self.last_block == Some(block) {
				(block_start + self.last_block_len).min(block_end)
			} else {
				block_start
			};

			if pos < filled_end {
				start.get_or_insert(pos);
				pos = filled_end;
				if filled_end < block_end {
					break;
				}
			} else if start.is_some() {
				break;
			} else {
				pos = block_end;
			}
		}

		start.map(|start| (start, pos - start))
	}

	/// Populated bytes starting exactly at `offset`, up to `limit` of them.
	#[must_use]
	pub fn readable_at(&self, offset: usize, limit: usize) -> usize {
		match self.populated_run(offset, offset + limit) {
			Some((start, len)) if start == offset => len,
			_ => 0,
		}
	}
}

fn decode_prefix(buf: &[u8]) -> Option<(u64, u32)> {
	let signature = u64::from_le_bytes(buf.get(0..8)?.try_into().ok()?);
	let magic = u32::from_le_bytes(buf.get(8..12)?.try_into().ok()?);
	(buf.len() >= PARENT_HEADER_SIZE).then_some((signature, magic))
}

/// Key of the child covering span `child` of the parent keyed `key`.
#[must_use]
pub fn child_key(key: &[u8], signature: u64, child: u64) -> Vec<u8> {
	let suffix = format!(":{signature:x}:{child:x}");

	let mut out = Vec::with_capacity(CHILD_KEY_PREFIX.len() + key.len() + suffix.len());
	out.extend_from_slice(CHILD_KEY_PREFIX);
	out.extend_from_slice(key);
	out.extend_from_slice(suffix.as_bytes());
	out
}

/// The part of a sparse request that falls inside a single child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildSpan {
	pub child: u64,
	pub offset: usize,
	pub len: usize,
}

impl ChildSpan {
	/// The span for the bytes starting at absolute offset `pos`, limited to
	/// `remaining` bytes and to the end of the child.
	#[must_use]
	#[allow(clippy::cast_possible_truncation)]
	pub fn at(pos: u64, remaining: usize) -> Self {
		let offset = (pos % CHILD_SPAN) as usize;

		Self {
			child: pos / CHILD_SPAN,
			offset,
			len: remaining.min(CHILD_SPAN as usize - offset),
		}
	}

	#[must_use]
	pub const fn base(&self) -> u64 {
		self.child * CHILD_SPAN
	}
}
