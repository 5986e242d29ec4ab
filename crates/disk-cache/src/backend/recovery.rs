//! Consistency pass run when the previous session didn't shut down cleanly,
//! and the self check behind [`crate::Backend::self_check`].
//!
//! The hash chains are the source of truth. Every record reachable from the
//! index is kept when it is intact, linked on the list and was closed by its
//! last user, and anything else found along the way is reclaimed. The list is
//! then checked against the survivors and rebuilt from their timestamps when
//! it can't be trusted.

use std::{
	cmp::Reverse,
	collections::{HashMap, HashSet},
};

use tracing::{debug, info, instrument, warn};

use crate::{
	addr::Addr,
	error::Error,
	format::{EntryState, EntryStore, NUM_STREAMS},
	rankings::{Direction, Rankings, Unlink},
};

use super::imp::BackendImpl;

/// A record that made it through the chain scan, keyed by its node.
#[derive(Debug, Clone, Copy)]
struct Survivor {
	entry: Addr,
	size: u64,
	last_used: i64,
}

impl BackendImpl {
	#[instrument(skip(self), fields(this_id = self.this_id()))]
	pub fn recover(&mut self) -> Result<(), Error> {
		warn!("Cache wasn't closed cleanly, checking it");

		let now = self.now();
		let mut rebuild = match self.rankings.complete_transaction(&mut self.disk, now) {
			Ok(node) => {
				if let Some(node) = node {
					debug!(%node, "Completed interrupted list operation");
				}
				false
			}
			Err(Error::Corrupted(reason)) => {
				warn!(%reason, "Couldn't complete interrupted list operation");
				true
			}
			Err(e) => return Err(e),
		};

		let live = self.scan_chains()?;

		if !rebuild {
			rebuild = !self.list_matches(&live)?;
		}
		if rebuild {
			self.rebuild_list(&live)?;
		}

		let header = self.disk.header_mut();
		header.num_entries = u32::try_from(live.len()).unwrap_or(u32::MAX);
		header.num_bytes = live.values().map(|survivor| survivor.size).sum();
		self.disk.store_header()?;

		info!(entries = live.len(), rebuilt = rebuild, "Cache recovered");

		Ok(())
	}

	/// Walks every chain, keeping the records that are fit to stay and
	/// reclaiming the rest. A record that can't be read cuts its chain.
	fn scan_chains(&mut self) -> Result<HashMap<Addr, Survivor>, Error> {
		let mut live = HashMap::new();
		let mut seen = HashSet::new();

		for bucket in 0..self.disk.index.table_len() {
			let mut prev = None;
			let mut current = self.disk.index.bucket(bucket);

			while current.is_initialized() {
				let store = if seen.insert(current) {
					self.disk
						.load_entry(current)
						.ok()
						.filter(|store| self.disk.index.bucket_for(store.hash) == bucket)
				} else {
					None
				};

				let Some(store) = store else {
					warn!(%current, bucket, "Cutting damaged hash chain");
					self.stats.invalid_entry += 1;
					self.set_chain_link(bucket, prev, Addr::NULL)?;
					break;
				};

				let next = store.next;
				let survivor = self
					.inspect(current, &store)
					.filter(|_| !live.contains_key(&store.rankings_node));

				if let Some(survivor) = survivor {
					live.insert(store.rankings_node, survivor);
					prev = Some(current);
				} else {
					self.stats.invalid_entry += 1;
					self.set_chain_link(bucket, prev, next)?;
					let owns_node = !live.contains_key(&store.rankings_node);
					self.reclaim(current, &store, owns_node)?;
				}

				current = next;
			}
		}

		Ok(live)
	}

	/// Whether the record at `addr` can stay.
	fn inspect(&mut self, addr: Addr, store: &EntryStore) -> Option<Survivor> {
		if store.state != EntryState::Normal {
			debug!(%addr, state = ?store.state, "Reclaiming entry left doomed");
			return None;
		}

		let Ok(node) = self.disk.load_node(store.rankings_node) else {
			debug!(%addr, "Reclaiming entry with a damaged node");
			return None;
		};

		if node.contents != addr {
			debug!(%addr, "Reclaiming entry whose node belongs elsewhere");
			return None;
		}

		if node.dirty != 0 {
			// Open in a session that never closed it, its content is suspect.
			debug!(%addr, dirty = node.dirty, "Reclaiming entry left open");
			return None;
		}

		if !node.is_linked() {
			debug!(%addr, "Reclaiming entry missing from the list");
			return None;
		}

		Some(Survivor {
			entry: addr,
			size: store
				.data_size
				.iter()
				.take(NUM_STREAMS)
				.map(|&size| u64::from(size))
				.sum(),
			last_used: node.last_used,
		})
	}

	/// Frees a record already cut out of its chain, taking its node off the
	/// list when it is safe to.
	fn reclaim(&mut self, addr: Addr, store: &EntryStore, owns_node: bool) -> Result<(), Error> {
		let node_addr = store.rankings_node;

		let free_node = owns_node
			&& match self.disk.load_node(node_addr) {
				Ok(mut node) if node.contents == addr => {
					!node.is_linked()
						|| matches!(
							self.rankings.remove(&mut self.disk, node_addr, &mut node),
							Ok(Unlink::Removed { .. } | Unlink::NotLinked)
						)
				}
				_ => false,
			};

		for data in store.data_addr.into_iter().chain([store.long_key]) {
			if data.is_initialized() && self.disk.storage.is_valid(data) {
				self.disk.storage.free(data)?;
			}
		}

		if free_node {
			self.disk.storage.delete_block(node_addr, true)?;
		}

		debug!(%addr, free_node, "Reclaimed entry");

		self.disk.storage.delete_block(addr, true)
	}

	/// Whether the list holds exactly the survivors with intact links. Nodes
	/// of reclaimed records still on the list are taken off on the way.
	fn list_matches(&mut self, live: &HashMap<Addr, Survivor>) -> Result<bool, Error> {
		'walk: loop {
			let lru = self.disk.lru();
			if !lru.head.is_initialized() || !lru.tail.is_initialized() {
				return Ok(live.is_empty() && lru.head == lru.tail);
			}

			let mut visited = HashSet::new();
			let mut expected_prev = lru.head;
			let mut current = lru.head;

			loop {
				if !visited.insert(current) {
					warn!(%current, "List loops back on itself");
					return Ok(false);
				}

				let Ok(mut node) = self.disk.load_node(current) else {
					warn!(%current, "Damaged node on the list");
					return Ok(false);
				};

				if node.prev != expected_prev {
					warn!(%current, "List links don't match");
					return Ok(false);
				}

				if !live
					.get(&current)
					.is_some_and(|survivor| survivor.entry == node.contents)
				{
					debug!(%current, "Dropping list node of a reclaimed entry");
					match self.rankings.remove(&mut self.disk, current, &mut node) {
						Ok(Unlink::Removed { .. }) => {
							self.disk.storage.delete_block(current, true)?;
							continue 'walk;
						}
						Ok(_) | Err(Error::Corrupted(_)) => return Ok(false),
						Err(e) => return Err(e),
					}
				}

				if node.next == current {
					break;
				}

				expected_prev = current;
				current = node.next;
			}

			return Ok(current == lru.tail && visited.len() == live.len());
		}
	}

	fn rebuild_list(&mut self, live: &HashMap<Addr, Survivor>) -> Result<(), Error> {
		warn!(entries = live.len(), "Rebuilding the rankings list");

		let mut nodes = live
			.iter()
			.map(|(&node, survivor)| (node, survivor.last_used))
			.collect::<Vec<_>>();
		nodes.sort_unstable_by_key(|&(node, last_used)| (Reverse(last_used), node.value()));

		let nodes = nodes.into_iter().map(|(node, _)| node).collect::<Vec<_>>();
		Rankings::relink(&mut self.disk, &nodes)
	}

	/// Cross checks the chains, the list and the entry counter, returning the
	/// number of entries when they agree.
	pub fn self_check(&mut self) -> Result<u32, Error> {
		let mut chained = HashSet::new();

		for bucket in 0..self.disk.index.table_len() {
			let mut current = self.disk.index.bucket(bucket);

			while current.is_initialized() {
				if !chained.insert(current) {
					return Err(Error::Corrupted(format!(
						"entry {current} is reachable twice from the index"
					)));
				}

				let store = self.chain_record(current)?;
				if store.state != EntryState::Normal {
					return Err(Error::Corrupted(format!(
						"doomed entry {current} is still indexed"
					)));
				}

				current = store.next;
			}
		}

		let mut listed = HashSet::new();
		let mut node_addr = None;

		while let Some(next) = Rankings::next_of(&mut self.disk, node_addr, Direction::Forward)? {
			if !listed.insert(next) {
				return Err(Error::Corrupted(format!("list loops back at {next}")));
			}

			let node = self.disk.load_node(next)?;
			if !chained.contains(&node.contents) {
				return Err(Error::Corrupted(format!(
					"list node {next} points to unindexed entry {}",
					node.contents
				)));
			}

			node_addr = Some(next);
		}

		let count = self.disk.header().num_entries;
		if chained.len() != listed.len() || listed.len() != count as usize {
			return Err(Error::Corrupted(format!(
				"{} indexed entries, {} listed, {count} counted",
				chained.len(),
				listed.len()
			)));
		}

		Ok(count)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use tempfile::{tempdir, TempDir};
	use tracing_test::traced_test;

	use crate::{
		backend::Backend, config::BackendConfig, error::Error, fault::RankCrash, index::IndexFile,
	};

	/// Entries present before the crashing operation.
	#[derive(Debug, Clone, Copy)]
	enum Setup {
		Empty,
		One,
		Head,
		Tail,
		Load,
	}

	impl Setup {
		const fn of(crash: RankCrash) -> Self {
			match crash {
				RankCrash::InsertEmpty1 | RankCrash::InsertEmpty2 | RankCrash::InsertEmpty3 => {
					Self::Empty
				}
				RankCrash::InsertOne1
				| RankCrash::InsertOne2
				| RankCrash::InsertOne3
				| RankCrash::RemoveOne1
				| RankCrash::RemoveOne2
				| RankCrash::RemoveOne3
				| RankCrash::RemoveOne4 => Self::One,
				RankCrash::RemoveHead1
				| RankCrash::RemoveHead2
				| RankCrash::RemoveHead3
				| RankCrash::RemoveHead4 => Self::Head,
				RankCrash::RemoveTail1 | RankCrash::RemoveTail2 | RankCrash::RemoveTail3 => {
					Self::Tail
				}
				RankCrash::InsertLoad1
				| RankCrash::InsertLoad2
				| RankCrash::RemoveLoad1
				| RankCrash::RemoveLoad2
				| RankCrash::RemoveLoad3 => Self::Load,
			}
		}

		const fn entries(self) -> usize {
			match self {
				Self::Empty => 0,
				Self::One => 1,
				Self::Head | Self::Tail => 2,
				Self::Load => 30,
			}
		}

		/// The entry a remove scenario dooms. The head is the last one created.
		fn victim(self) -> String {
			key(match self {
				Self::Head => 1,
				Self::Load => 15,
				Self::Empty | Self::One | Self::Tail => 0,
			})
		}
	}

	fn key(n: usize) -> String {
		format!("the first key {n}")
	}

	fn config(dir: &TempDir) -> BackendConfig {
		// Small table so the load setup shares chains.
		BackendConfig::new(dir.path()).with_table_len(16)
	}

	async fn crash_and_reopen(crash: RankCrash) {
		let dir = tempdir().unwrap();
		let setup = Setup::of(crash);

		let backend = Backend::open(config(&dir)).await.unwrap();
		for n in 0..setup.entries() {
			backend.create_entry(key(n)).await.unwrap();
		}
		backend.shutdown().await.unwrap();

		let backend = Backend::open_with_fault_injector(config(&dir), Arc::new(crash))
			.await
			.unwrap();

		let (crashed_key, expected) = if crash.is_insert() {
			let crashed_key = "the crashing key".to_owned();
			let res = backend.create_entry(crashed_key.clone()).await;
			assert!(
				matches!(res, Err(Error::InjectedCrash(location)) if location == crash.location()),
				"{crash:?}: {res:?}"
			);
			(crashed_key, setup.entries())
		} else {
			let crashed_key = setup.victim();
			let res = backend.doom_entry(crashed_key.clone()).await;
			assert!(
				matches!(res, Err(Error::InjectedCrash(location)) if location == crash.location()),
				"{crash:?}: {res:?}"
			);
			(crashed_key, setup.entries() - 1)
		};

		// The worker stopped on the crash, nothing more reaches the disk.
		assert!(matches!(
			backend.create_entry("too late").await,
			Err(Error::Shutdown | Error::Canceled)
		));
		backend.shutdown().await.unwrap();

		let expected = u32::try_from(expected).unwrap();
		let backend = Backend::open(config(&dir)).await.unwrap();

		assert_eq!(backend.entry_count(), expected, "{crash:?}");
		assert_eq!(backend.self_check().await.unwrap(), expected, "{crash:?}");
		assert!(
			matches!(backend.open_entry(crashed_key).await, Err(Error::NotFound)),
			"{crash:?}"
		);

		backend.create_entry("a key after recovery").await.unwrap();
		assert_eq!(backend.self_check().await.unwrap(), expected + 1, "{crash:?}");

		backend.shutdown().await.unwrap();
	}

	#[tokio::test]
	#[traced_test]
	async fn recovers_from_interrupted_inserts() {
		for crash in RankCrash::ALL.into_iter().filter(|crash| crash.is_insert()) {
			crash_and_reopen(crash).await;
		}
	}

	#[tokio::test]
	#[traced_test]
	async fn recovers_from_interrupted_removes() {
		for crash in RankCrash::ALL.into_iter().filter(|crash| !crash.is_insert()) {
			crash_and_reopen(crash).await;
		}
	}

	#[tokio::test]
	#[traced_test]
	async fn broken_list_is_rebuilt_from_timestamps() {
		let dir = tempdir().unwrap();

		let backend = Backend::open(config(&dir)).await.unwrap();
		for n in 0..5 {
			backend.create_entry(key(n)).await.unwrap();
		}
		backend.shutdown().await.unwrap();

		{
			let mut index = IndexFile::open(dir.path()).unwrap();
			let header = index.header_mut();
			header.crash = true;
			header.lru.tail = header.lru.head;
			index.store_header().unwrap();
		}

		let backend = Backend::open(config(&dir)).await.unwrap();
		assert_eq!(backend.self_check().await.unwrap(), 5);

		let iter = backend.enumerate();
		let mut keys = Vec::new();
		while let Some(entry) = backend.open_next_entry(&iter).await.unwrap() {
			keys.push(String::from_utf8(entry.key().to_vec()).unwrap());
		}

		assert_eq!(keys, (0..5).rev().map(key).collect::<Vec<_>>());

		drop(iter);
		backend.shutdown().await.unwrap();
	}
}
