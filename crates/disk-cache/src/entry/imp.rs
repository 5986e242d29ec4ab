use std::sync::Arc;

use tracing::{trace, warn};

use crate::{
	addr::{Addr, FileType},
	disk::Disk,
	error::Error,
	format::{EntryState, EntryStore, RankingsNode, CHILD_ENTRY, NUM_STREAMS, PARENT_ENTRY},
};

use super::EntryInfo;

/// Worker side view of an open entry: the record and its rankings node as
/// last stored, plus the full key.
#[derive(Debug)]
pub(crate) struct EntryImpl {
	pub addr: Addr,
	pub store: EntryStore,
	pub node: RankingsNode,
	pub key: Vec<u8>,
	pub info: Arc<EntryInfo>,
	pub doomed: bool,
	/// The rankings node couldn't be unlinked safely, it stays allocated so the
	/// list never points into freed blocks.
	pub orphaned: bool,
}

impl EntryImpl {
	/// Allocates and stores a fresh record with its (still unlinked) rankings
	/// node. The caller links it into the hash chain and the list.
	pub fn create(
		disk: &mut Disk,
		key: &[u8],
		hash: u32,
		flags: u32,
		now: i64,
		dirty: u32,
	) -> Result<Self, Error> {
		let key_len =
			u32::try_from(key.len()).map_err(|_| Error::InvalidArgument("key is too long"))?;

		let addr = disk
			.storage
			.create_block(FileType::Block256, EntryStore::blocks_for_key(key.len()))?;
		let node_addr = disk.storage.create_block(FileType::Rankings, 1)?;

		let long_key = if EntryStore::key_is_inline(key.len()) {
			Addr::NULL
		} else {
			let long_key = disk.allocate(key.len())?;
			disk.storage.write(long_key, 0, key)?;
			long_key
		};

		let node = RankingsNode {
			last_used: now,
			last_modified: now,
			contents: addr,
			dirty,
			..Default::default()
		};
		disk.store_node(node_addr, &node)?;

		let store = EntryStore {
			hash,
			rankings_node: node_addr,
			creation_time: now,
			key_len,
			long_key,
			flags,
			key: if long_key.is_initialized() {
				Vec::new()
			} else {
				key.to_vec()
			},
			..Default::default()
		};
		disk.store_entry(addr, &store)?;

		trace!(%addr, %node_addr, "Created entry record");

		let info = Arc::new(EntryInfo::new(key));
		info.set_times(now, now);

		Ok(Self {
			addr,
			store,
			node,
			key: key.to_vec(),
			info,
			doomed: false,
			orphaned: false,
		})
	}

	/// Loads the record at `addr` along with its node and key.
	pub fn load(disk: &mut Disk, addr: Addr) -> Result<Self, Error> {
		let store = disk.load_entry(addr)?;
		let node = disk.load_node(store.rankings_node)?;

		if node.contents != addr {
			return Err(Error::Corrupted(format!(
				"rankings node {} doesn't belong to entry {addr}",
				store.rankings_node
			)));
		}

		let key = read_key(disk, &store)?;

		let info = Arc::new(EntryInfo::new(&key));
		info.set_times(node.last_used, node.last_modified);
		for (stream, &size) in store.data_size.iter().take(NUM_STREAMS).enumerate() {
			info.set_data_size(stream, size);
		}

		Ok(Self {
			addr,
			doomed: store.state != EntryState::Normal,
			store,
			node,
			key,
			info,
			orphaned: false,
		})
	}

	pub const fn node_addr(&self) -> Addr {
		self.store.rankings_node
	}

	pub const fn data_size(&self, stream: usize) -> usize {
		self.store.data_size[stream] as usize
	}

	/// Bytes accounted to this entry in the cache budget.
	pub fn total_size(&self) -> u64 {
		self.store
			.data_size
			.iter()
			.take(NUM_STREAMS)
			.map(|&size| u64::from(size))
			.sum()
	}

	pub const fn is_sparse_parent(&self) -> bool {
		self.store.flags & PARENT_ENTRY != 0
	}

	pub const fn is_sparse_child(&self) -> bool {
		self.store.flags & CHILD_ENTRY != 0
	}

	/// Stamps the node with the id of the session that has it open, zero
	/// meaning closed cleanly.
	pub fn set_dirty(&mut self, disk: &mut Disk, dirty: u32) -> Result<(), Error> {
		self.refresh_node(disk)?;
		self.node.dirty = dirty;
		disk.store_node(self.node_addr(), &self.node)
	}

	/// Reloads the node from disk. List operations on the neighbours rewrite
	/// its links without going through this copy.
	pub fn refresh_node(&mut self, disk: &mut Disk) -> Result<(), Error> {
		self.node = disk.load_node(self.node_addr())?;
		Ok(())
	}

	pub fn store(&self, disk: &mut Disk) -> Result<(), Error> {
		disk.store_entry(self.addr, &self.store)
	}

	pub fn mark_doomed(&mut self, disk: &mut Disk) -> Result<(), Error> {
		self.doomed = true;
		self.store.state = EntryState::Doomed;
		self.info.set_doomed();
		self.store(disk)
	}

	pub fn read_data(
		&self,
		disk: &mut Disk,
		stream: usize,
		offset: usize,
		len: usize,
	) -> Result<Vec<u8>, Error> {
		let size = self.data_size(stream);
		if offset >= size || len == 0 {
			return Ok(Vec::new());
		}

		let mut buf = vec![0; len.min(size - offset)];
		disk.storage
			.read(self.store.data_addr[stream], offset, &mut buf)?;

		Ok(buf)
	}

	/// Writes `data` at `offset`, relocating the stream when its new length
	/// belongs to another storage class. Returns how much the stream grew.
	pub fn write_data(
		&mut self,
		disk: &mut Disk,
		stream: usize,
		offset: usize,
		data: &[u8],
		truncate: bool,
		max_size: usize,
	) -> Result<i64, Error> {
		let old_size = self.data_size(stream);
		let end = offset + data.len();
		let new_size = if truncate { end } else { old_size.max(end) };

		if new_size > max_size {
			return Err(Error::EntryTooLarge {
				size: new_size as u64,
				max: max_size as u64,
			});
		}

		let old_addr = self.store.data_addr[stream];

		if new_size == 0 {
			disk.storage.free(old_addr)?;
			self.store.data_addr[stream] = Addr::NULL;
		} else if needs_relocation(old_addr, new_size) {
			let mut content = vec![0; new_size];
			let keep = old_size.min(new_size);
			if keep > 0 {
				disk.storage.read(old_addr, 0, &mut content[..keep])?;
			}
			content[offset..end].copy_from_slice(data);

			let new_addr = disk.allocate(new_size)?;
			disk.storage.write(new_addr, 0, &content)?;
			disk.storage.free(old_addr)?;

			trace!(addr = %self.addr, stream, from = %old_addr, to = %new_addr, "Relocated stream");
			self.store.data_addr[stream] = new_addr;
		} else {
			if offset > old_size {
				disk.storage
					.write(old_addr, old_size, &vec![0; offset - old_size])?;
			}
			if !data.is_empty() {
				disk.storage.write(old_addr, offset, data)?;
			}
			if new_size < old_size {
				disk.storage.truncate(old_addr, new_size)?;
			}
		}

		#[allow(clippy::cast_possible_truncation)]
		let stored_size = new_size as u32;
		self.store.data_size[stream] = stored_size;
		self.store(disk)?;
		self.info.set_data_size(stream, stored_size);

		#[allow(clippy::cast_possible_wrap)]
		Ok(new_size as i64 - old_size as i64)
	}

	/// Frees every block and file owned by the entry, the record included.
	pub fn free_storage(self, disk: &mut Disk) -> Result<(), Error> {
		trace!(addr = %self.addr, "Freeing entry storage");

		for addr in self.store.data_addr {
			disk.storage.free(addr)?;
		}
		disk.storage.free(self.store.long_key)?;

		if self.orphaned {
			warn!(node = %self.node_addr(), "Leaking orphaned rankings node");
		} else {
			disk.storage.delete_block(self.node_addr(), true)?;
		}

		disk.storage.delete_block(self.addr, true)
	}
}

/// The full key of a record, following `long_key` if needed.
pub(crate) fn read_key(disk: &mut Disk, store: &EntryStore) -> Result<Vec<u8>, Error> {
	if !store.long_key.is_initialized() {
		return Ok(store.key.clone());
	}

	if !disk.storage.is_valid(store.long_key) {
		return Err(Error::Corrupted(format!(
			"missing long key at {}",
			store.long_key
		)));
	}

	let mut key = vec![0; store.key_len as usize];
	disk.storage.read(store.long_key, 0, &mut key)?;

	Ok(key)
}

/// Whether a stream stored at `addr` can't hold `size` bytes in place.
fn needs_relocation(addr: Addr, size: usize) -> bool {
	if !addr.is_initialized() {
		return true;
	}

	match FileType::for_size(size) {
		FileType::External => !addr.is_separate_file(),
		file_type => {
			addr.file_type() != Some(file_type)
				|| addr.num_blocks() != size.div_ceil(file_type.block_size())
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{index::IndexFile, storage::Storage};

	use tempfile::{tempdir, TempDir};

	const MAX: usize = 1 << 20;

	fn disk() -> (TempDir, Disk) {
		let dir = tempdir().unwrap();
		let disk = Disk {
			index: IndexFile::create(dir.path(), 16, 0).unwrap(),
			storage: Storage::init(dir.path(), true).unwrap(),
		};
		(dir, disk)
	}

	#[test]
	fn streams_move_between_storage_classes() {
		let (_dir, mut disk) = disk();
		let mut entry = EntryImpl::create(&mut disk, b"key", 1, 0, 10, 0).unwrap();

		let small = vec![1; 500];
		assert_eq!(entry.write_data(&mut disk, 0, 0, &small, false, MAX).unwrap(), 500);
		let addr = entry.store.data_addr[0];
		assert_eq!(addr.file_type(), Some(FileType::Block256));
		assert_eq!(addr.num_blocks(), 2);

		// Grows into an external file keeping the old bytes.
		let big = vec![2; 20_000];
		entry.write_data(&mut disk, 0, 500, &big, false, MAX).unwrap();
		assert!(entry.store.data_addr[0].is_separate_file());
		assert!(!disk.storage.is_valid(addr));

		let all = entry.read_data(&mut disk, 0, 0, usize::MAX).unwrap();
		assert_eq!(all.len(), 20_500);
		assert_eq!(&all[..500], &small[..]);
		assert!(all[500..].iter().all(|&b| b == 2));

		// And back into a block run.
		assert_eq!(
			entry.write_data(&mut disk, 0, 100, &[3; 100], true, MAX).unwrap(),
			-20_300
		);
		assert_eq!(entry.store.data_addr[0].file_type(), Some(FileType::Block256));
		let all = entry.read_data(&mut disk, 0, 0, usize::MAX).unwrap();
		assert_eq!(&all[..100], &small[..100]);
		assert_eq!(&all[100..], &[3; 100]);
	}

	#[test]
	fn gaps_are_zero_filled_and_reads_clamped() {
		let (_dir, mut disk) = disk();
		let mut entry = EntryImpl::create(&mut disk, b"key", 1, 0, 10, 0).unwrap();

		entry.write_data(&mut disk, 1, 0, &[9; 300], false, MAX).unwrap();
		entry.write_data(&mut disk, 1, 0, &[], true, MAX).unwrap();
		assert_eq!(entry.data_size(1), 0);
		assert!(!entry.store.data_addr[1].is_initialized());

		entry.write_data(&mut disk, 1, 200, &[7; 10], false, MAX).unwrap();
		let all = entry.read_data(&mut disk, 1, 0, 1000).unwrap();
		assert_eq!(all.len(), 210);
		assert!(all[..200].iter().all(|&b| b == 0));

		assert!(entry.read_data(&mut disk, 1, 210, 10).unwrap().is_empty());
		assert_eq!(entry.read_data(&mut disk, 1, 205, 10).unwrap(), vec![7; 5]);
	}

	#[test]
	fn oversized_writes_are_rejected() {
		let (_dir, mut disk) = disk();
		let mut entry = EntryImpl::create(&mut disk, b"key", 1, 0, 10, 0).unwrap();

		assert!(matches!(
			entry.write_data(&mut disk, 0, 1000, &[1; 100], false, 1024),
			Err(Error::EntryTooLarge { size: 1100, max: 1024 })
		));
		assert_eq!(entry.data_size(0), 0);
	}

	#[test]
	fn long_keys_survive_reload() {
		let (_dir, mut disk) = disk();
		let key = vec![b'k'; 5000];
		let entry = EntryImpl::create(&mut disk, &key, 1, 0, 10, 0).unwrap();
		assert!(entry.store.long_key.is_separate_file() || entry.store.long_key.is_block_file());

		let loaded = EntryImpl::load(&mut disk, entry.addr).unwrap();
		assert_eq!(loaded.key, key);
		assert_eq!(loaded.node_addr(), entry.node_addr());

		loaded.free_storage(&mut disk).unwrap();
		assert!(!disk.storage.is_valid(entry.addr));
		assert!(!disk.storage.is_valid(entry.store.long_key));
	}
}
