use std::path::Path;

use tracing::debug;

use crate::{
	addr::Addr,
	error::Error,
	format::{IndexHeader, CURRENT_VERSION, INDEX_HEADER_SIZE, INDEX_MAGIC},
	storage::CacheFile,
};

pub const INDEX_NAME: &str = "index";

/// Default bucket count, enough for a few hundred megabytes of entries.
pub const BASE_TABLE_LEN: u32 = 0x1_0000;
const ENTRIES_STORE_64K: u64 = 240 * 1000 * 1000;

/// Bucket count for a cache of `max_bytes`.
#[must_use]
pub const fn desired_table_len(max_bytes: u64) -> u32 {
	let mut multiplier = 1;
	while multiplier < 16 && max_bytes > ENTRIES_STORE_64K * multiplier as u64 {
		multiplier *= 2;
	}
	BASE_TABLE_LEN * multiplier
}

/// The `index` file: the header holding global counters and the LRU list
/// ends, followed by the hash table of chain heads.
pub struct IndexFile {
	file: CacheFile,
	header: IndexHeader,
	table: Vec<Addr>,
}

impl IndexFile {
	pub fn create(dir: &Path, table_len: u32, create_time: i64) -> Result<Self, Error> {
		let file = CacheFile::create(dir.join(INDEX_NAME))?;
		let header = IndexHeader::new(table_len, create_time);

		let mut buf = header.encode();
		buf.resize(INDEX_HEADER_SIZE + table_len as usize * 4, 0);
		file.write_at(0, &buf)?;

		debug!(table_len, "Created index file");

		Ok(Self {
			file,
			header,
			table: vec![Addr::NULL; table_len as usize],
		})
	}

	pub fn open(dir: &Path) -> Result<Self, Error> {
		let file = CacheFile::open(dir.join(INDEX_NAME))?;
		let file_len = file.file_len()?;

		if file_len < INDEX_HEADER_SIZE as u64 {
			return Err(Error::Corrupted("index file is too small".into()));
		}

		let mut buf = vec![0; INDEX_HEADER_SIZE];
		file.read_at(0, &mut buf)?;
		let header = IndexHeader::decode(&buf);

		if header.magic != INDEX_MAGIC || header.version != CURRENT_VERSION {
			return Err(Error::Corrupted("invalid index magic or version".into()));
		}

		if header.table_len == 0 || !header.table_len.is_power_of_two() {
			return Err(Error::Corrupted(format!(
				"invalid hash table length: {}",
				header.table_len
			)));
		}

		let table_bytes = header.table_len as usize * 4;
		if file_len < (INDEX_HEADER_SIZE + table_bytes) as u64 {
			return Err(Error::Corrupted("index file is truncated".into()));
		}

		let mut raw = vec![0; table_bytes];
		file.read_at(INDEX_HEADER_SIZE as u64, &mut raw)?;
		let table = raw
			.chunks_exact(4)
			.map(|chunk| Addr::from_value(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])))
			.collect();

		Ok(Self {
			file,
			header,
			table,
		})
	}

	#[must_use]
	pub const fn header(&self) -> &IndexHeader {
		&self.header
	}

	/// Changes are only persisted by [`Self::store_header`].
	pub fn header_mut(&mut self) -> &mut IndexHeader {
		&mut self.header
	}

	pub fn store_header(&self) -> Result<(), Error> {
		self.file.write_at(0, &self.header.encode())
	}

	#[must_use]
	pub fn table_len(&self) -> usize {
		self.table.len()
	}

	#[must_use]
	pub fn bucket_for(&self, hash: u32) -> usize {
		hash as usize & (self.table.len() - 1)
	}

	#[must_use]
	pub fn bucket(&self, bucket: usize) -> Addr {
		self.table[bucket]
	}

	pub fn set_bucket(&mut self, bucket: usize, addr: Addr) -> Result<(), Error> {
		self.table[bucket] = addr;
		self.file.write_at(
			(INDEX_HEADER_SIZE + bucket * 4) as u64,
			&addr.value().to_le_bytes(),
		)
	}

	pub fn sync(&self) -> Result<(), Error> {
		self.file.sync()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::addr::FileType;

	use tempfile::tempdir;

	#[test]
	fn header_and_buckets_survive_reopen() {
		let dir = tempdir().unwrap();
		let addr = Addr::new_block(FileType::Block256, 1, 1, 42);

		{
			let mut index = IndexFile::create(dir.path(), 16, 1234).unwrap();
			let bucket = index.bucket_for(0xffff_fff3);
			assert_eq!(bucket, 3);

			index.set_bucket(bucket, addr).unwrap();
			index.header_mut().num_entries = 1;
			index.header_mut().crash = true;
			index.store_header().unwrap();
		}

		let index = IndexFile::open(dir.path()).unwrap();
		assert_eq!(index.table_len(), 16);
		assert_eq!(index.bucket(index.bucket_for(0x13)), addr);
		assert_eq!(index.header().num_entries, 1);
		assert!(index.header().crash);
		assert_eq!(index.header().create_time, 1234);
	}

	#[test]
	fn garbage_index_is_rejected() {
		let dir = tempdir().unwrap();
		std::fs::write(dir.path().join(INDEX_NAME), vec![0x5a; 4096]).unwrap();

		assert!(matches!(IndexFile::open(dir.path()), Err(Error::Corrupted(_))));
	}

	#[test]
	fn table_len_scales_with_budget() {
		assert_eq!(desired_table_len(80 * 1024 * 1024), BASE_TABLE_LEN);
		assert_eq!(desired_table_len(400 * 1000 * 1000), BASE_TABLE_LEN * 2);
		assert_eq!(desired_table_len(u64::MAX), BASE_TABLE_LEN * 16);
	}
}
