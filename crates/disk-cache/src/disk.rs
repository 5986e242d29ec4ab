use crate::{
	addr::{Addr, FileType},
	error::Error,
	format::{EntryStore, IndexHeader, LruData, RankingsNode},
	index::IndexFile,
	storage::Storage,
};

/// The open cache directory: index plus every block and external file.
pub struct Disk {
	pub index: IndexFile,
	pub storage: Storage,
}

impl Disk {
	pub const fn header(&self) -> &IndexHeader {
		self.index.header()
	}

	pub fn header_mut(&mut self) -> &mut IndexHeader {
		self.index.header_mut()
	}

	pub fn store_header(&self) -> Result<(), Error> {
		self.index.store_header()
	}

	pub const fn lru(&self) -> LruData {
		self.index.header().lru
	}

	pub fn lru_mut(&mut self) -> &mut LruData {
		&mut self.index.header_mut().lru
	}

	/// Loads a rankings node, anything that doesn't resolve to an allocated
	/// and intact node is reported as corruption.
	pub fn load_node(&mut self, addr: Addr) -> Result<RankingsNode, Error> {
		if !addr.is_valid_for(FileType::Rankings) || !self.storage.is_valid(addr) {
			return Err(Error::Corrupted(format!("invalid rankings node address {addr}")));
		}

		RankingsNode::decode(&self.storage.read_block(addr)?)
			.ok_or_else(|| Error::Corrupted(format!("damaged rankings node at {addr}")))
	}

	pub fn store_node(&mut self, addr: Addr, node: &RankingsNode) -> Result<(), Error> {
		self.storage.write(addr, 0, &node.encode())
	}

	/// Loads an entry record, with the same validation as [`Self::load_node`].
	pub fn load_entry(&mut self, addr: Addr) -> Result<EntryStore, Error> {
		if !addr.is_valid_for(FileType::Block256) || !self.storage.is_valid(addr) {
			return Err(Error::Corrupted(format!("invalid entry address {addr}")));
		}

		let store = EntryStore::decode(&self.storage.read_block(addr)?)
			.filter(|store| {
				store.addrs_look_sane()
					&& EntryStore::blocks_for_key(store.key_len as usize) == addr.num_blocks()
			})
			.ok_or_else(|| Error::Corrupted(format!("damaged entry record at {addr}")))?;

		Ok(store)
	}

	/// Storage for a payload of `size` bytes. External files are numbered
	/// after the last one handed out, which the header remembers.
	pub fn allocate(&mut self, size: usize) -> Result<Addr, Error> {
		let next_file = self.header().last_file.wrapping_add(1);
		let addr = self.storage.allocate(size, next_file)?;

		if addr.is_separate_file() {
			self.header_mut().last_file = addr.file_number();
			self.store_header()?;
		}

		Ok(addr)
	}

	pub fn store_entry(&mut self, addr: Addr, store: &EntryStore) -> Result<(), Error> {
		self.storage
			.write(addr, 0, &store.encode(addr.num_blocks()))
	}
}
