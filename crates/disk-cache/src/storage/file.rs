use std::{
	fs::{File, OpenOptions},
	io::{self, Read, Seek, SeekFrom, Write},
	path::{Path, PathBuf},
};

use crate::error::{Error, FileIOError};

/// A file addressed with explicit offsets, every cache file goes through this.
#[derive(Debug)]
pub struct CacheFile {
	path: PathBuf,
	file: File,
}

impl CacheFile {
	/// Creates the file, truncating any previous content.
	pub fn create(path: impl Into<PathBuf>) -> Result<Self, Error> {
		let path = path.into();
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(true)
			.open(&path)
			.map_err(|e| FileIOError::from((&path, e, "Failed to create cache file")))?;

		Ok(Self { path, file })
	}

	/// Creates the file only if it doesn't exist yet.
	pub fn create_new(path: impl Into<PathBuf>) -> Result<Self, Error> {
		let path = path.into();
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create_new(true)
			.open(&path)
			.map_err(|e| FileIOError::from((&path, e, "Failed to create cache file")))?;

		Ok(Self { path, file })
	}

	pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
		let path = path.into();
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.open(&path)
			.map_err(|e| FileIOError::from((&path, e, "Failed to open cache file")))?;

		Ok(Self { path, file })
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn file_len(&self) -> Result<u64, Error> {
		self.file
			.metadata()
			.map(|metadata| metadata.len())
			.map_err(|e| FileIOError::from((&self.path, e, "Failed to read file length")).into())
	}

	pub fn set_len(&self, len: u64) -> Result<(), Error> {
		self.file
			.set_len(len)
			.map_err(|e| FileIOError::from((&self.path, e, "Failed to resize file")).into())
	}

	/// Fills `buf` completely, a short file is an error.
	pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
		let mut file = &self.file;
		file.seek(SeekFrom::Start(offset))
			.and_then(|_| file.read_exact(buf))
			.map_err(|e| FileIOError::from((&self.path, e, "Failed to read")).into())
	}

	/// Reads up to `buf.len()` bytes, stopping at end of file.
	pub fn read_available(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
		let mut file = &self.file;
		file.seek(SeekFrom::Start(offset))
			.map_err(|e| FileIOError::from((&self.path, e, "Failed to seek")))?;

		let mut read = 0;
		while read < buf.len() {
			match file.read(&mut buf[read..]) {
				Ok(0) => break,
				Ok(n) => read += n,
				Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
				Err(e) => return Err(FileIOError::from((&self.path, e, "Failed to read")).into()),
			}
		}

		Ok(read)
	}

	pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
		let mut file = &self.file;
		file.seek(SeekFrom::Start(offset))
			.and_then(|_| file.write_all(data))
			.map_err(|e| FileIOError::from((&self.path, e, "Failed to write")).into())
	}

	pub fn sync(&self) -> Result<(), Error> {
		self.file
			.sync_data()
			.map_err(|e| FileIOError::from((&self.path, e, "Failed to sync")).into())
	}
}

pub fn remove_file(path: &Path) -> Result<(), Error> {
	match std::fs::remove_file(path) {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(FileIOError::from((path, e, "Failed to remove cache file")).into()),
	}
}
