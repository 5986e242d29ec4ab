use std::fmt;

/// Kind of storage an [`Addr`] points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FileType {
	External = 0,
	Rankings = 1,
	Block256 = 2,
	Block1K = 3,
	Block4K = 4,
}

/// Max number of contiguous blocks a single record can span.
pub const MAX_NUM_BLOCKS: usize = 4;

impl FileType {
	/// Block files for `Rankings..=Block4K` are `data_0..=data_3`.
	pub const BLOCK_TYPES: [Self; 4] = [Self::Rankings, Self::Block256, Self::Block1K, Self::Block4K];

	#[must_use]
	pub const fn block_size(self) -> usize {
		match self {
			Self::External => 0,
			Self::Rankings => 36,
			Self::Block256 => 256,
			Self::Block1K => 1024,
			Self::Block4K => 4096,
		}
	}

	/// Picks the storage class for a payload of `size` bytes.
	#[must_use]
	pub const fn for_size(size: usize) -> Self {
		if size < 1024 {
			Self::Block256
		} else if size < 4096 {
			Self::Block1K
		} else if size <= 4096 * MAX_NUM_BLOCKS {
			Self::Block4K
		} else {
			Self::External
		}
	}

	const fn from_bits(bits: u32) -> Option<Self> {
		match bits {
			0 => Some(Self::External),
			1 => Some(Self::Rankings),
			2 => Some(Self::Block256),
			3 => Some(Self::Block1K),
			4 => Some(Self::Block4K),
			_ => None,
		}
	}

	/// Index of the first file of this block class, which is also the chain head.
	#[must_use]
	pub const fn first_file(self) -> u8 {
		(self as u8).saturating_sub(1)
	}
}

const INITIALIZED_MASK: u32 = 0x8000_0000;
const FILE_TYPE_MASK: u32 = 0x7000_0000;
const FILE_TYPE_OFFSET: u32 = 28;
const RESERVED_BITS_MASK: u32 = 0x0c00_0000;
const NUM_BLOCKS_MASK: u32 = 0x0300_0000;
const NUM_BLOCKS_OFFSET: u32 = 24;
const FILE_SELECTOR_MASK: u32 = 0x00ff_0000;
const FILE_SELECTOR_OFFSET: u32 = 16;
const START_BLOCK_MASK: u32 = 0x0000_ffff;
const FILE_NAME_MASK: u32 = 0x0fff_ffff;

/// A disk address: either a run of blocks inside a block file or a whole
/// external file.
///
/// Layout for block files:
/// ```text
///   1000 0000 0000 0000 0000 0000 0000 0000 : initialized bit
///   0111 0000 0000 0000 0000 0000 0000 0000 : file type
///   0000 1100 0000 0000 0000 0000 0000 0000 : reserved bits
///   0000 0011 0000 0000 0000 0000 0000 0000 : number of contiguous blocks - 1
///   0000 0000 1111 1111 0000 0000 0000 0000 : file selector
///   0000 0000 0000 0000 1111 1111 1111 1111 : start block
/// ```
/// External files keep the file number in the low 28 bits instead.
///
/// Addrs are the only way records reference each other, so they must survive
/// restarts; resolving one to bytes is [`BlockFiles`](crate::storage::BlockFiles)'s job.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Addr(u32);

impl Addr {
	pub const NULL: Self = Self(0);

	#[must_use]
	pub const fn from_value(value: u32) -> Self {
		Self(value)
	}

	/// # Panics
	///
	/// Debug builds assert that `num_blocks` is within `1..=4`.
	#[must_use]
	pub const fn new_block(file_type: FileType, num_blocks: usize, file: u8, start: u16) -> Self {
		debug_assert!(num_blocks >= 1 && num_blocks <= MAX_NUM_BLOCKS);

		#[allow(clippy::cast_possible_truncation)]
		let blocks = ((num_blocks - 1) as u32) << NUM_BLOCKS_OFFSET;

		Self(
			INITIALIZED_MASK
				| ((file_type as u32) << FILE_TYPE_OFFSET)
				| (blocks & NUM_BLOCKS_MASK)
				| ((file as u32) << FILE_SELECTOR_OFFSET)
				| start as u32,
		)
	}

	#[must_use]
	pub const fn new_external(file_number: u32) -> Self {
		Self(INITIALIZED_MASK | (file_number & FILE_NAME_MASK))
	}

	#[must_use]
	pub const fn value(self) -> u32 {
		self.0
	}

	#[must_use]
	pub const fn is_initialized(self) -> bool {
		self.0 & INITIALIZED_MASK != 0
	}

	#[must_use]
	pub const fn is_separate_file(self) -> bool {
		self.is_initialized() && self.0 & FILE_TYPE_MASK == 0
	}

	#[must_use]
	pub const fn is_block_file(self) -> bool {
		self.is_initialized() && !self.is_separate_file()
	}

	#[must_use]
	pub const fn file_type(self) -> Option<FileType> {
		FileType::from_bits((self.0 & FILE_TYPE_MASK) >> FILE_TYPE_OFFSET)
	}

	/// Block file selector, or external file number for separate files.
	#[must_use]
	pub const fn file_number(self) -> u32 {
		if self.is_separate_file() {
			self.0 & FILE_NAME_MASK
		} else {
			(self.0 & FILE_SELECTOR_MASK) >> FILE_SELECTOR_OFFSET
		}
	}

	#[must_use]
	pub const fn start_block(self) -> usize {
		(self.0 & START_BLOCK_MASK) as usize
	}

	#[must_use]
	pub const fn num_blocks(self) -> usize {
		(((self.0 & NUM_BLOCKS_MASK) >> NUM_BLOCKS_OFFSET) + 1) as usize
	}

	#[must_use]
	pub const fn block_size(self) -> usize {
		match self.file_type() {
			Some(file_type) => file_type.block_size(),
			None => 0,
		}
	}

	/// Total bytes covered by a block run.
	#[must_use]
	pub const fn byte_len(self) -> usize {
		self.block_size() * self.num_blocks()
	}

	/// Cheap structural validation, done on every address read from disk
	/// before trusting it.
	#[must_use]
	pub const fn sanity_check(self) -> bool {
		if !self.is_initialized() {
			return self.0 == 0;
		}

		match self.file_type() {
			None => false,
			Some(FileType::External) => true,
			Some(_) => self.0 & RESERVED_BITS_MASK == 0,
		}
	}

	/// Same as [`Self::sanity_check`] but also demands a specific block class.
	#[must_use]
	pub fn is_valid_for(self, expected: FileType) -> bool {
		self.sanity_check()
			&& self.is_block_file()
			&& self.file_type() == Some(expected)
	}
}

impl fmt::Debug for Addr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Addr({:#010x})", self.0)
	}
}

impl fmt::Display for Addr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:#010x}", self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn block_addr_packing() {
		let addr = Addr::new_block(FileType::Block1K, 3, 7, 0x1234);

		assert!(addr.is_initialized());
		assert!(addr.is_block_file());
		assert!(!addr.is_separate_file());
		assert_eq!(addr.file_type(), Some(FileType::Block1K));
		assert_eq!(addr.num_blocks(), 3);
		assert_eq!(addr.file_number(), 7);
		assert_eq!(addr.start_block(), 0x1234);
		assert_eq!(addr.byte_len(), 3 * 1024);
		assert!(addr.sanity_check());
		assert!(addr.is_valid_for(FileType::Block1K));
		assert!(!addr.is_valid_for(FileType::Block4K));
	}

	#[test]
	fn external_addr_packing() {
		let addr = Addr::new_external(0x0abc_def1);

		assert!(addr.is_separate_file());
		assert_eq!(addr.file_type(), Some(FileType::External));
		assert_eq!(addr.file_number(), 0x0abc_def1);
		assert!(addr.sanity_check());
	}

	#[test]
	fn garbage_is_rejected() {
		assert!(Addr::NULL.sanity_check());
		assert!(!Addr::NULL.is_initialized());
		// Type 7 doesn't exist.
		assert!(!Addr::from_value(0xf000_0001).sanity_check());
		// Reserved bits set.
		assert!(!Addr::from_value(0xa400_0001).sanity_check());
		// Not initialized but with payload.
		assert!(!Addr::from_value(0x2000_0001).sanity_check());
	}

	#[test]
	fn size_classes() {
		assert_eq!(FileType::for_size(1), FileType::Block256);
		assert_eq!(FileType::for_size(1023), FileType::Block256);
		assert_eq!(FileType::for_size(1024), FileType::Block1K);
		assert_eq!(FileType::for_size(4095), FileType::Block1K);
		assert_eq!(FileType::for_size(16 * 1024), FileType::Block4K);
		assert_eq!(FileType::for_size(16 * 1024 + 1), FileType::External);
	}
}
