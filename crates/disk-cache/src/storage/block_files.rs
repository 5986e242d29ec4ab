use std::path::{Path, PathBuf};

use tracing::{debug, error, trace, warn};

use crate::{
	addr::{Addr, FileType, MAX_NUM_BLOCKS},
	error::Error,
	format::{BlockFileHeader, BLOCK_HEADER_SIZE, BLOCK_MAGIC, CURRENT_VERSION, MAX_BLOCKS},
};

use super::file::{remove_file, CacheFile};

/// Files `data_0..data_3` are the chain heads, extra files start here.
pub const FIRST_ADDITIONAL_BLOCK_FILE: usize = 4;
const MAX_BLOCK_FILE: usize = 255;
const GROW_STEP: u32 = 1024;

/// Length of the free run at the top of a 4 blocks group, by bit pattern.
const NIBBLE_FREE_RUN: [usize; 16] = [4, 3, 2, 2, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0];

const fn free_run(nibble: u32) -> usize {
	NIBBLE_FREE_RUN[(nibble & 0xf) as usize]
}

fn file_type_for_entry_size(entry_size: u32) -> Option<FileType> {
	FileType::BLOCK_TYPES
		.into_iter()
		.find(|file_type| file_type.block_size() == entry_size as usize)
}

/// Marks `size` blocks as used inside a group whose free top run is exactly
/// `target` blocks long. Returns the first block and the touched map word.
#[allow(clippy::cast_possible_truncation)]
fn create_map_block(
	header: &mut BlockFileHeader,
	target: usize,
	size: usize,
) -> Option<(usize, usize)> {
	let words = header.max_entries as usize / 32;
	let mut current = header.hints[target - 1] as usize;

	for _ in 0..words {
		if current >= words {
			current = 0;
		}

		let mut map_block = header.allocation_map[current];
		for nibble in 0..8 {
			if free_run(map_block) == target {
				let index_offset = nibble * 4 + 4 - target;
				header.allocation_map[current] |= ((1 << size) - 1) << index_offset;

				header.hints[target - 1] = current as u32;
				header.empty[target - 1] = header.empty[target - 1].saturating_sub(1);
				header.num_entries += 1;
				if target != size {
					header.empty[target - size - 1] += 1;
				}

				return Some((current * 32 + index_offset, current));
			}
			map_block >>= 4;
		}

		current += 1;
	}

	None
}

/// Clears a run of blocks, returns the touched map word.
fn delete_map_block(header: &mut BlockFileHeader, index: usize, size: usize) -> usize {
	let word = index / 32;
	let shift = (index % 32) / 4 * 4;
	let in_group = index % 4;

	let group = (header.allocation_map[word] >> shift) & 0xf;
	let bits_at_end = 4 - size - in_group;
	let end_mask = (0xf << (4 - bits_at_end)) & 0xf;
	// The freed run only counts as an empty run if it reaches the top of the group.
	let update_counters = group & end_mask == 0;
	let run_mask = ((1 << size) - 1) << in_group;
	let new_type = free_run(group & !run_mask);

	header.allocation_map[word] &= !(run_mask << shift);

	if update_counters {
		if bits_at_end > 0 {
			header.empty[bits_at_end - 1] = header.empty[bits_at_end - 1].saturating_sub(1);
		}
		header.empty[new_type - 1] += 1;
	}
	header.num_entries = header.num_entries.saturating_sub(1);

	word
}

fn used_map_block(header: &BlockFileHeader, index: usize, size: usize) -> bool {
	if index + size > header.max_entries as usize || index / 4 != (index + size - 1) / 4 {
		return false;
	}

	let word = index / 32;
	let mask = ((1 << size) - 1) << (index % 32);
	header.allocation_map[word] & mask == mask
}

/// Rebuilds the empty run counters and hints from the allocation map.
fn fix_allocation_counters(header: &mut BlockFileHeader) {
	header.hints = [0; 4];
	header.empty = [0; 4];

	for word in 0..header.max_entries as usize / 32 {
		let mut map_block = header.allocation_map[word];
		for _ in 0..8 {
			let run = free_run(map_block);
			if run > 0 {
				header.empty[run - 1] += 1;
			}
			map_block >>= 4;
		}
	}
}

/// True when this file can't take a `block_count` run as it is.
fn need_to_grow(header: &BlockFileHeader, block_count: usize) -> bool {
	let mut have_space = false;
	let mut empty_blocks = 0;
	for (i, empty) in header.empty.iter().enumerate() {
		empty_blocks += *empty as usize * (i + 1);
		if i + 1 >= block_count && *empty > 0 {
			have_space = true;
		}
	}

	// Keep an almost full file out of rotation while a follow up file exists,
	// so freed blocks have a chance to coalesce.
	if header.next_file != 0 && empty_blocks < MAX_BLOCKS / 10 {
		return true;
	}

	!have_space
}

struct BlockFile {
	file: CacheFile,
	header: BlockFileHeader,
	file_type: FileType,
}

impl BlockFile {
	fn store_fields(&self) -> Result<(), Error> {
		self.file.write_at(0, &self.header.encode_fields())
	}

	fn store_map_word(&self, word: usize) -> Result<(), Error> {
		self.file.write_at(
			BlockFileHeader::map_word_offset(word),
			&self.header.allocation_map[word].to_le_bytes(),
		)
	}

	/// A crash between this and [`Self::end_update`] leaves the flag set on
	/// disk, so the next open rebuilds the counters from the map.
	fn begin_update(&mut self) -> Result<(), Error> {
		self.header.updating += 1;
		self.store_fields()
	}

	fn end_update(&mut self, word: Option<usize>) -> Result<(), Error> {
		self.header.updating = self.header.updating.saturating_sub(1);
		if let Some(word) = word {
			self.store_map_word(word)?;
		}
		self.store_fields()
	}

	const fn block_offset(&self, start: usize) -> u64 {
		(BLOCK_HEADER_SIZE + start * self.header.entry_size as usize) as u64
	}

	const fn expected_len(&self) -> u64 {
		(BLOCK_HEADER_SIZE + self.header.max_entries as usize * self.header.entry_size as usize)
			as u64
	}
}

/// Repairs a header left with the `updating` flag set.
fn fix_block_file_header(file: &CacheFile, header: &mut BlockFileHeader) -> Result<(), Error> {
	let file_len = file.file_len()?;
	let entry_size = u64::from(header.entry_size);
	let expected = BLOCK_HEADER_SIZE as u64 + entry_size * u64::from(header.max_entries);

	if file_len != expected {
		let max_expected = BLOCK_HEADER_SIZE as u64 + entry_size * MAX_BLOCKS as u64;
		if file_len < expected || header.empty[3] != 0 || file_len > max_expected {
			return Err(Error::Corrupted(format!(
				"unexpected block file size: <path='{}'>",
				file.path().display()
			)));
		}

		// We were in the middle of growing the file.
		header.max_entries = u32::try_from((file_len - BLOCK_HEADER_SIZE as u64) / entry_size)
			.map_err(|_| Error::Corrupted("block file is too big".into()))?;
	}

	fix_allocation_counters(header);
	header.updating = 0;

	file.write_at(0, &header.encode())
}

/// Size classed block pools. Each class is a chain of files starting at
/// `data_<class>`, every file is a header with an allocation bitmap followed
/// by fixed size blocks.
pub struct BlockFiles {
	path: PathBuf,
	files: Vec<Option<BlockFile>>,
}

impl BlockFiles {
	pub fn init(path: &Path, create: bool) -> Result<Self, Error> {
		let mut this = Self {
			path: path.to_path_buf(),
			files: Vec::with_capacity(FIRST_ADDITIONAL_BLOCK_FILE),
		};

		for file_type in FileType::BLOCK_TYPES {
			let index = usize::from(file_type.first_file());
			if create {
				this.create_block_file(index, file_type, true)?;
			}

			this.open_block_file(index)?;
			this.remove_empty_files(file_type)?;
		}

		Ok(this)
	}

	fn name(&self, index: usize) -> PathBuf {
		self.path.join(format!("data_{index}"))
	}

	fn create_block_file(&self, index: usize, file_type: FileType, force: bool) -> Result<(), Error> {
		let path = self.name(index);
		let file = if force {
			CacheFile::create(path)?
		} else {
			CacheFile::create_new(path)?
		};

		#[allow(clippy::cast_possible_truncation)]
		let header = BlockFileHeader::new(index as u16, file_type.block_size());

		file.write_at(0, &header.encode())
	}

	fn open_block_file(&mut self, index: usize) -> Result<(), Error> {
		if self.files.len() <= index {
			self.files.resize_with(index + 1, || None);
		}

		let file = CacheFile::open(self.name(index))?;
		if file.file_len()? < BLOCK_HEADER_SIZE as u64 {
			return Err(Error::Corrupted(format!("block file {index} is too small")));
		}

		let mut buf = vec![0; BLOCK_HEADER_SIZE];
		file.read_at(0, &mut buf)?;
		let mut header = BlockFileHeader::decode(&buf);

		if header.magic != BLOCK_MAGIC || header.version != CURRENT_VERSION {
			return Err(Error::Corrupted(format!(
				"invalid magic or version on block file {index}"
			)));
		}

		let file_type = file_type_for_entry_size(header.entry_size).ok_or_else(|| {
			Error::Corrupted(format!("invalid block size on block file {index}"))
		})?;

		if header.updating != 0 {
			warn!(index, "Block file was not properly closed, rebuilding its counters");
			fix_block_file_header(&file, &mut header)?;
		}

		let block_file = BlockFile {
			file,
			header,
			file_type,
		};

		if block_file.file.file_len()? < block_file.expected_len() {
			return Err(Error::Corrupted(format!("block file {index} is truncated")));
		}

		trace!(index, ?file_type, "Opened block file");
		self.files[index] = Some(block_file);

		Ok(())
	}

	fn file_mut(&mut self, index: usize) -> Result<&mut BlockFile, Error> {
		if self.files.get(index).map_or(true, Option::is_none) {
			self.open_block_file(index)?;
		}

		self.files
			.get_mut(index)
			.and_then(Option::as_mut)
			.ok_or(Error::Failed("block file is not open"))
	}

	/// Resolves a block address to its file, rejecting anything that doesn't
	/// fit inside the file it claims to live in.
	fn checked_file(&mut self, addr: Addr) -> Result<&mut BlockFile, Error> {
		let invalid = || Error::Corrupted(format!("invalid block address {addr}"));

		if !addr.sanity_check() || !addr.is_block_file() {
			return Err(invalid());
		}

		let block_file = self
			.file_mut(addr.file_number() as usize)
			.map_err(|_| invalid())?;

		let start = addr.start_block();
		let end = start + addr.num_blocks();
		if Some(block_file.file_type) != addr.file_type()
			|| end > block_file.header.max_entries as usize
			|| start / 4 != (end - 1) / 4
		{
			return Err(invalid());
		}

		Ok(block_file)
	}

	/// Allocates a run of `block_count` contiguous blocks of the given class.
	pub fn create_block(&mut self, file_type: FileType, block_count: usize) -> Result<Addr, Error> {
		if file_type == FileType::External || !(1..=MAX_NUM_BLOCKS).contains(&block_count) {
			return Err(Error::InvalidArgument("invalid block type or count"));
		}

		let index = self.file_for_new_block(file_type, block_count)?;
		let block_file = self.file_mut(index)?;

		let target = (block_count..=MAX_NUM_BLOCKS)
			.find(|run| block_file.header.empty[run - 1] > 0)
			.ok_or(Error::Failed("block file has no room left"))?;

		block_file.begin_update()?;
		let Some((start, word)) = create_map_block(&mut block_file.header, target, block_count)
		else {
			// Counters disagree with the map, possibly from an undetected crash.
			error!(index, "Failed to create a map block, fixing allocation counters");
			fix_allocation_counters(&mut block_file.header);
			block_file.end_update(None)?;
			block_file.file.write_at(0, &block_file.header.encode())?;
			return Err(Error::Failed("block allocation failed"));
		};
		block_file.end_update(Some(word))?;

		#[allow(clippy::cast_possible_truncation)]
		let addr = Addr::new_block(
			file_type,
			block_count,
			block_file.header.this_file as u8,
			start as u16,
		);

		trace!(%addr, "Created block");

		Ok(addr)
	}

	/// Frees a run of blocks, zeroing the content first when `deep` is set.
	pub fn delete_block(&mut self, addr: Addr, deep: bool) -> Result<(), Error> {
		if !addr.is_block_file() {
			return Ok(());
		}

		let block_file = self.checked_file(addr)?;
		let (start, size) = (addr.start_block(), addr.num_blocks());

		if !used_map_block(&block_file.header, start, size) {
			warn!(%addr, "Trying to delete a block that is not allocated");
			return Ok(());
		}

		if deep {
			block_file
				.file
				.write_at(block_file.block_offset(start), &vec![0; addr.byte_len()])?;
		}

		block_file.begin_update()?;
		let word = delete_map_block(&mut block_file.header, start, size);
		block_file.end_update(Some(word))?;

		trace!(%addr, "Deleted block");

		if block_file.header.num_entries == 0 {
			let file_type = block_file.file_type;
			self.remove_empty_files(file_type)?;
		}

		Ok(())
	}

	/// Whether `addr` points at an allocated run.
	pub fn is_allocated(&mut self, addr: Addr) -> bool {
		self.checked_file(addr).is_ok_and(|block_file| {
			used_map_block(&block_file.header, addr.start_block(), addr.num_blocks())
		})
	}

	/// Reads the whole run.
	pub fn read(&mut self, addr: Addr) -> Result<Vec<u8>, Error> {
		let mut buf = vec![0; addr.byte_len()];
		self.read_at(addr, 0, &mut buf)?;
		Ok(buf)
	}

	pub fn read_at(&mut self, addr: Addr, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
		if offset + buf.len() > addr.byte_len() {
			return Err(Error::InvalidArgument("read past the end of a block run"));
		}

		let block_file = self.checked_file(addr)?;
		block_file
			.file
			.read_at(block_file.block_offset(addr.start_block()) + offset as u64, buf)
	}

	pub fn write(&mut self, addr: Addr, offset: usize, data: &[u8]) -> Result<(), Error> {
		if offset + data.len() > addr.byte_len() {
			return Err(Error::InvalidArgument("write past the end of a block run"));
		}

		let block_file = self.checked_file(addr)?;
		block_file
			.file
			.write_at(block_file.block_offset(addr.start_block()) + offset as u64, data)
	}

	fn file_for_new_block(&mut self, file_type: FileType, block_count: usize) -> Result<usize, Error> {
		let mut index = usize::from(file_type.first_file());

		loop {
			let header = &self.file_mut(index)?.header;
			if !need_to_grow(header, block_count) {
				return Ok(index);
			}

			if header.max_entries as usize == MAX_BLOCKS {
				index = self.next_file(index)?;
				continue;
			}

			self.grow_block_file(index)?;
			return Ok(index);
		}
	}

	fn grow_block_file(&mut self, index: usize) -> Result<(), Error> {
		let block_file = self.file_mut(index)?;
		let old_size = block_file.header.max_entries;
		#[allow(clippy::cast_possible_truncation)]
		let new_size = (old_size + GROW_STEP).min(MAX_BLOCKS as u32);

		block_file.begin_update()?;
		block_file.file.set_len(
			BLOCK_HEADER_SIZE as u64 + u64::from(new_size) * u64::from(block_file.header.entry_size),
		)?;
		block_file.header.empty[3] += (new_size - old_size) / 4;
		block_file.header.max_entries = new_size;
		block_file.end_update(None)?;

		debug!(index, new_size, "Grew block file");

		Ok(())
	}

	/// Follows (or extends) the chain of files for the class of `index`.
	fn next_file(&mut self, index: usize) -> Result<usize, Error> {
		let block_file = self.file_mut(index)?;
		if block_file.header.next_file != 0 {
			return Ok(usize::from(block_file.header.next_file));
		}

		let file_type = block_file.file_type;
		let new_index = self.create_next_block_file(file_type)?;

		let block_file = self.file_mut(index)?;
		block_file.begin_update()?;
		block_file.header.next_file = u16::try_from(new_index)
			.map_err(|_| Error::Failed("no more block files can be created"))?;
		block_file.end_update(None)?;

		debug!(index, new_index, ?file_type, "Chained a new block file");

		Ok(new_index)
	}

	fn create_next_block_file(&mut self, file_type: FileType) -> Result<usize, Error> {
		for index in FIRST_ADDITIONAL_BLOCK_FILE..=MAX_BLOCK_FILE {
			if self.files.get(index).is_some_and(Option::is_some) {
				continue;
			}

			if self.create_block_file(index, file_type, false).is_ok() {
				return Ok(index);
			}
		}

		Err(Error::Failed("no more block files can be created"))
	}

	/// Drops empty files from the chain of `file_type`, never the chain head.
	fn remove_empty_files(&mut self, file_type: FileType) -> Result<(), Error> {
		let mut index = usize::from(file_type.first_file());

		loop {
			let next = usize::from(self.file_mut(index)?.header.next_file);
			if next == 0 {
				return Ok(());
			}

			let next_header = &self.file_mut(next)?.header;
			if next_header.num_entries != 0 {
				index = next;
				continue;
			}

			let next_next = next_header.next_file;
			let block_file = self.file_mut(index)?;
			block_file.header.next_file = next_next;
			block_file.store_fields()?;

			if let Some(removed) = self.files.get_mut(next).and_then(Option::take) {
				let path = removed.file.path().to_path_buf();
				drop(removed);
				remove_file(&path)?;
				debug!(index = next, "Removed empty block file");
			}
		}
	}
}
