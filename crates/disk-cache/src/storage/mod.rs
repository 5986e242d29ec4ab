//! Block storage: size classed block pools for records and small payloads,
//! plus standalone files for anything bigger than four 4 KiB blocks.

use std::path::{Path, PathBuf};

use tracing::trace;

use crate::{
	addr::{Addr, FileType},
	error::Error,
};

mod block_files;
mod file;

pub use block_files::BlockFiles;
pub use file::{remove_file, CacheFile};

const FILE_NAME_MASK: u32 = 0x0fff_ffff;

/// Owns every file of the cache directory except the index.
pub struct Storage {
	path: PathBuf,
	blocks: BlockFiles,
}

impl Storage {
	pub fn init(path: &Path, create: bool) -> Result<Self, Error> {
		Ok(Self {
			path: path.to_path_buf(),
			blocks: BlockFiles::init(path, create)?,
		})
	}

	#[must_use]
	pub fn external_name(&self, addr: Addr) -> PathBuf {
		self.path.join(format!("f_{:06x}", addr.file_number()))
	}

	/// Allocates a block run of the given class.
	pub fn create_block(&mut self, file_type: FileType, num_blocks: usize) -> Result<Addr, Error> {
		self.blocks.create_block(file_type, num_blocks)
	}

	/// Creates a new empty external file, trying file numbers upwards from
	/// `first_candidate` until an unused one is found.
	pub fn create_external(&self, first_candidate: u32) -> Result<Addr, Error> {
		let mut number = first_candidate.max(1) & FILE_NAME_MASK;

		for _ in 0..FILE_NAME_MASK {
			let addr = Addr::new_external(number);
			match CacheFile::create_new(self.external_name(addr)) {
				Ok(_) => {
					trace!(%addr, "Created external file");
					return Ok(addr);
				}
				Err(Error::FileIO(e)) if e.source.kind() == std::io::ErrorKind::AlreadyExists => {
					number = (number + 1) & FILE_NAME_MASK;
					if number == 0 {
						number = 1;
					}
				}
				Err(e) => return Err(e),
			}
		}

		Err(Error::Failed("external file numbers exhausted"))
	}

	/// Storage for a payload of `size` bytes: a block run for small sizes,
	/// otherwise a fresh external file numbered from `next_file`.
	pub fn allocate(&mut self, size: usize, next_file: u32) -> Result<Addr, Error> {
		match FileType::for_size(size) {
			FileType::External => self.create_external(next_file),
			file_type => self
				.blocks
				.create_block(file_type, size.div_ceil(file_type.block_size()).max(1)),
		}
	}

	/// Releases whatever `addr` points to.
	pub fn free(&mut self, addr: Addr) -> Result<(), Error> {
		if !addr.is_initialized() {
			return Ok(());
		}

		if addr.is_separate_file() {
			trace!(%addr, "Removing external file");
			remove_file(&self.external_name(addr))
		} else {
			self.blocks.delete_block(addr, false)
		}
	}

	/// Frees a block run wiping its content.
	pub fn delete_block(&mut self, addr: Addr, deep: bool) -> Result<(), Error> {
		self.blocks.delete_block(addr, deep)
	}

	/// Whether `addr` resolves to something allocated.
	pub fn is_valid(&mut self, addr: Addr) -> bool {
		if addr.is_separate_file() {
			self.external_name(addr).is_file()
		} else {
			self.blocks.is_allocated(addr)
		}
	}

	/// Reads a whole block run.
	pub fn read_block(&mut self, addr: Addr) -> Result<Vec<u8>, Error> {
		self.blocks.read(addr)
	}

	/// Fills `buf` from `offset` inside the payload at `addr`. External files
	/// shorter than requested read back as zeros.
	pub fn read(&mut self, addr: Addr, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
		if addr.is_separate_file() {
			let file = CacheFile::open(self.external_name(addr))?;
			let read = file.read_available(offset as u64, buf)?;
			buf[read..].fill(0);
			Ok(())
		} else {
			self.blocks.read_at(addr, offset, buf)
		}
	}

	pub fn write(&mut self, addr: Addr, offset: usize, data: &[u8]) -> Result<(), Error> {
		if addr.is_separate_file() {
			CacheFile::open(self.external_name(addr))?.write_at(offset as u64, data)
		} else {
			self.blocks.write(addr, offset, data)
		}
	}

	/// Cuts an external file down to `len` bytes, block runs keep their size.
	pub fn truncate(&mut self, addr: Addr, len: usize) -> Result<(), Error> {
		if addr.is_separate_file() {
			CacheFile::open(self.external_name(addr))?.set_len(len as u64)
		} else {
			Ok(())
		}
	}
}
