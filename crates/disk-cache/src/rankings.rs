//! The persisted LRU list.
//!
//! The list is doubly linked through the rankings nodes, with both ends kept in
//! the index header. The head is the most recently used entry; the head points
//! back to itself and so does the tail forwards. Nodes that are not on the list
//! have both links cleared.
//!
//! Inserting and removing touch up to three nodes plus the header, and a crash
//! can interrupt them after any of those writes. Before starting, the node and
//! the kind of operation are recorded in the header, so that the next open can
//! finish an insert or revert a remove and get back to a consistent list.

#[cfg(any(test, feature = "fault-injection"))]
use std::sync::Arc;

use tracing::{trace, warn};

use crate::{
	addr::{Addr, FileType},
	disk::Disk,
	error::Error,
	format::{LruData, Operation, RankingsNode},
};

#[cfg(any(test, feature = "fault-injection"))]
use crate::fault::{CrashLocation, FaultInjector};

/// Outcome of unlinking a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unlink {
	/// The node was on the list and now isn't, these were its neighbours.
	Removed { next: Addr, prev: Addr },
	/// The node wasn't on the list to begin with.
	NotLinked,
	/// The links around the node are inconsistent. The node was left where it
	/// is, touching the neighbours could break the rest of the list.
	Orphaned,
}

/// Which end of the list an enumeration starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	/// From the most recently used entry to the least recently used one.
	Forward,
	Backward,
}

#[derive(Debug, Default, Clone)]
pub struct Rankings {
	#[cfg(any(test, feature = "fault-injection"))]
	injector: Option<Arc<dyn FaultInjector>>,
}

#[cfg(not(any(test, feature = "fault-injection")))]
type CrashLocation = ();

impl Rankings {
	#[cfg(any(test, feature = "fault-injection"))]
	pub fn with_injector(injector: Option<Arc<dyn FaultInjector>>) -> Self {
		Self { injector }
	}

	#[cfg(any(test, feature = "fault-injection"))]
	fn crash_point(&self, location: CrashLocation) -> Result<(), Error> {
		if self
			.injector
			.as_ref()
			.is_some_and(|injector| injector.should_crash(location))
		{
			warn!(?location, "Injected crash");
			return Err(Error::InjectedCrash(location));
		}

		Ok(())
	}

	#[cfg(not(any(test, feature = "fault-injection")))]
	#[allow(clippy::unused_self, clippy::unnecessary_wraps)]
	#[inline]
	const fn crash_point(&self, (): CrashLocation) -> Result<(), Error> {
		Ok(())
	}

	fn begin_transaction(disk: &mut Disk, node: Addr, operation: Operation) -> Result<(), Error> {
		let lru = disk.lru_mut();
		lru.transaction = node;
		lru.operation = operation;
		disk.store_header()
	}

	fn end_transaction(disk: &mut Disk) -> Result<(), Error> {
		let lru = disk.lru_mut();
		lru.transaction = Addr::NULL;
		lru.operation = Operation::None;
		disk.store_header()
	}

	/// Links `node` at the head of the list and stamps it as used at `now`.
	pub fn insert(
		&self,
		disk: &mut Disk,
		node_addr: Addr,
		node: &mut RankingsNode,
		modified: bool,
		now: i64,
	) -> Result<(), Error> {
		trace!(%node_addr, "Inserting rankings node");
		Self::begin_transaction(disk, node_addr, Operation::Insert)?;

		let LruData { head, tail, .. } = disk.lru();
		if head.is_initialized() {
			let mut head_node = disk.load_node(head)?;
			if head_node.prev != head && head_node.prev != node_addr {
				return Err(Error::Corrupted(format!(
					"list head {head} doesn't point back to itself"
				)));
			}

			head_node.prev = node_addr;
			disk.store_node(head, &head_node)?;
			self.crash_point(on(Crash::Insert1))?;
		}

		node.next = head;
		node.prev = node_addr;

		if !tail.is_initialized() || tail == node_addr {
			node.next = node_addr;
			disk.lru_mut().tail = node_addr;
			disk.store_header()?;
			self.crash_point(on(Crash::Insert2))?;
		}

		node.last_used = now;
		if modified {
			node.last_modified = now;
		}
		disk.store_node(node_addr, node)?;
		self.crash_point(on(Crash::Insert3))?;

		// The head moves last, once the node it points to is fully stored.
		disk.lru_mut().head = node_addr;
		disk.store_header()?;
		self.crash_point(on(Crash::Insert4))?;

		Self::end_transaction(disk)
	}

	/// Unlinks `node` from the list. The node is stored with cleared links,
	/// unless it gets orphaned.
	pub fn remove(
		&self,
		disk: &mut Disk,
		node_addr: Addr,
		node: &mut RankingsNode,
	) -> Result<Unlink, Error> {
		let (next_addr, prev_addr) = (node.next, node.prev);

		if !next_addr.is_initialized() || !prev_addr.is_initialized() {
			if next_addr.is_initialized() || prev_addr.is_initialized() {
				warn!(%node_addr, "Node with a single link, it was never fully inserted");
			}
			return Ok(Unlink::NotLinked);
		}

		if !next_addr.is_valid_for(FileType::Rankings) || !prev_addr.is_valid_for(FileType::Rankings)
		{
			warn!(%node_addr, "Node with invalid links, orphaning it");
			return Ok(Unlink::Orphaned);
		}

		let (Ok(mut next), Ok(mut prev)) = (disk.load_node(next_addr), disk.load_node(prev_addr))
		else {
			warn!(%node_addr, "Node with unreadable neighbours, orphaning it");
			return Ok(Unlink::Orphaned);
		};

		if !check_links(node_addr, node, &prev, &next, disk.lru()) {
			warn!(%node_addr, "Neighbours don't point to this node, orphaning it");
			return Ok(Unlink::Orphaned);
		}

		trace!(%node_addr, "Removing rankings node");
		Self::begin_transaction(disk, node_addr, Operation::Remove)?;

		prev.next = next_addr;
		next.prev = prev_addr;
		self.crash_point(on(Crash::Remove1))?;

		let LruData { head, tail, .. } = disk.lru();
		if node_addr == head || node_addr == tail {
			if head == tail {
				disk.lru_mut().head = Addr::NULL;
				disk.store_header()?;
				self.crash_point(on(Crash::Remove2))?;

				disk.lru_mut().tail = Addr::NULL;
				disk.store_header()?;
				self.crash_point(on(Crash::Remove3))?;
			} else if node_addr == head {
				disk.lru_mut().head = next_addr;
				next.prev = next_addr;
				disk.store_header()?;
				self.crash_point(on(Crash::Remove4))?;
			} else {
				disk.lru_mut().tail = prev_addr;
				prev.next = prev_addr;
				disk.store_header()?;
				self.crash_point(on(Crash::Remove5))?;

				// The new tail goes to disk now, so the operation can be undone.
				disk.store_node(prev_addr, &prev)?;
				self.crash_point(on(Crash::Remove6))?;
			}
		}

		node.next = Addr::NULL;
		node.prev = Addr::NULL;

		// The node itself is the last thing written, until then there is
		// enough on disk to revert.
		disk.store_node(next_addr, &next)?;
		self.crash_point(on(Crash::Remove7))?;
		disk.store_node(prev_addr, &prev)?;
		self.crash_point(on(Crash::Remove8))?;
		disk.store_node(node_addr, node)?;

		Self::end_transaction(disk)?;

		Ok(Unlink::Removed {
			next: next_addr,
			prev: prev_addr,
		})
	}

	/// Moves `node` to the head, refreshing its timestamps.
	pub fn update_rank(
		&self,
		disk: &mut Disk,
		node_addr: Addr,
		node: &mut RankingsNode,
		modified: bool,
		now: i64,
	) -> Result<Unlink, Error> {
		if disk.lru().head == node_addr {
			node.last_used = now;
			if modified {
				node.last_modified = now;
			}
			disk.store_node(node_addr, node)?;
			return Ok(Unlink::NotLinked);
		}

		let unlink = self.remove(disk, node_addr, node)?;
		if unlink == Unlink::Orphaned {
			return Ok(unlink);
		}

		self.insert(disk, node_addr, node, modified, now)?;

		Ok(unlink)
	}

	/// Finishes or reverts the list operation interrupted by a crash, returns
	/// the node that was involved.
	pub fn complete_transaction(&self, disk: &mut Disk, now: i64) -> Result<Option<Addr>, Error> {
		let LruData {
			transaction,
			operation,
			..
		} = disk.lru();

		if !transaction.is_initialized() {
			return Ok(None);
		}

		if !transaction.is_valid_for(FileType::Rankings) {
			Self::end_transaction(disk)?;
			return Err(Error::Corrupted(format!(
				"transaction on invalid node {transaction}"
			)));
		}

		warn!(%transaction, ?operation, "Completing interrupted list operation");

		match operation {
			Operation::Insert => self.finish_insert(disk, transaction, now)?,
			Operation::Remove => Self::revert_remove(disk, transaction)?,
			Operation::None => Self::end_transaction(disk)?,
		}

		Ok(Some(transaction))
	}

	fn finish_insert(&self, disk: &mut Disk, node_addr: Addr, now: i64) -> Result<(), Error> {
		Self::end_transaction(disk)?;

		let mut node = disk.load_node(node_addr)?;
		let LruData { head, tail, .. } = disk.lru();

		if head != node_addr {
			// Insert treats a tail equal to the node as an empty list.
			if tail == node_addr {
				disk.lru_mut().tail = node.next;
			}
			self.insert(disk, node_addr, &mut node, true, now)?;
		}

		Ok(())
	}

	fn revert_remove(disk: &mut Disk, node_addr: Addr) -> Result<(), Error> {
		let Ok(node) = disk.load_node(node_addr) else {
			return Self::end_transaction(disk);
		};

		let (next_addr, prev_addr) = (node.next, node.prev);
		if !next_addr.is_initialized() || !prev_addr.is_initialized() {
			// The operation actually finished.
			return Self::end_transaction(disk);
		}

		let mut next = disk.load_node(next_addr)?;
		let mut prev = disk.load_node(prev_addr)?;

		if node_addr != prev_addr {
			prev.next = node_addr;
		}
		if node_addr != next_addr {
			next.prev = node_addr;
		}

		let LruData { head, tail, .. } = disk.lru();
		if !head.is_initialized() || !tail.is_initialized() {
			let lru = disk.lru_mut();
			lru.head = node_addr;
			lru.tail = node_addr;
			disk.store_header()?;
		} else if head == next_addr {
			disk.lru_mut().head = node_addr;
			prev.next = next_addr;
			disk.store_header()?;
		} else if tail == prev_addr {
			disk.lru_mut().tail = node_addr;
			next.prev = prev_addr;
			disk.store_header()?;
		}

		disk.store_node(next_addr, &next)?;
		disk.store_node(prev_addr, &prev)?;

		Self::end_transaction(disk)
	}

	/// Replaces the whole list with `nodes`, head first. Used to rebuild a
	/// list that can't be repaired in place.
	pub fn relink(disk: &mut Disk, nodes: &[Addr]) -> Result<(), Error> {
		for (i, &node_addr) in nodes.iter().enumerate() {
			let mut node = disk.load_node(node_addr)?;
			node.prev = if i == 0 { node_addr } else { nodes[i - 1] };
			node.next = nodes.get(i + 1).copied().unwrap_or(node_addr);
			disk.store_node(node_addr, &node)?;
		}

		let lru = disk.lru_mut();
		lru.head = nodes.first().copied().unwrap_or(Addr::NULL);
		lru.tail = nodes.last().copied().unwrap_or(Addr::NULL);
		lru.transaction = Addr::NULL;
		lru.operation = Operation::None;
		disk.store_header()
	}

	/// The node following `current` in `direction`, or the first one when
	/// `current` is `None`.
	pub fn next_of(
		disk: &mut Disk,
		current: Option<Addr>,
		direction: Direction,
	) -> Result<Option<Addr>, Error> {
		let lru = disk.lru();

		let Some(current) = current else {
			let start = match direction {
				Direction::Forward => lru.head,
				Direction::Backward => lru.tail,
			};
			return Ok(start.is_initialized().then_some(start));
		};

		let node = disk.load_node(current)?;
		let next = match direction {
			Direction::Forward => node.next,
			Direction::Backward => node.prev,
		};

		Ok((next.is_initialized() && next != current).then_some(next))
	}
}

/// A regular node is pointed at by both neighbours, the ends point to
/// themselves and are referenced by the header instead.
fn check_links(
	node_addr: Addr,
	node: &RankingsNode,
	prev: &RankingsNode,
	next: &RankingsNode,
	lru: LruData,
) -> bool {
	let prev_ok = if node.prev == node_addr {
		lru.head == node_addr
	} else {
		prev.next == node_addr
	};

	let next_ok = if node.next == node_addr {
		lru.tail == node_addr
	} else {
		next.prev == node_addr
	};

	prev_ok && next_ok
}

/// Crash points, named by mutation step so the list code reads the same with
/// or without fault injection compiled in.
#[derive(Clone, Copy)]
enum Crash {
	Insert1,
	Insert2,
	Insert3,
	Insert4,
	Remove1,
	Remove2,
	Remove3,
	Remove4,
	Remove5,
	Remove6,
	Remove7,
	Remove8,
}

#[cfg(any(test, feature = "fault-injection"))]
const fn on(crash: Crash) -> CrashLocation {
	match crash {
		Crash::Insert1 => CrashLocation::OnInsert1,
		Crash::Insert2 => CrashLocation::OnInsert2,
		Crash::Insert3 => CrashLocation::OnInsert3,
		Crash::Insert4 => CrashLocation::OnInsert4,
		Crash::Remove1 => CrashLocation::OnRemove1,
		Crash::Remove2 => CrashLocation::OnRemove2,
		Crash::Remove3 => CrashLocation::OnRemove3,
		Crash::Remove4 => CrashLocation::OnRemove4,
		Crash::Remove5 => CrashLocation::OnRemove5,
		Crash::Remove6 => CrashLocation::OnRemove6,
		Crash::Remove7 => CrashLocation::OnRemove7,
		Crash::Remove8 => CrashLocation::OnRemove8,
	}
}

#[cfg(not(any(test, feature = "fault-injection")))]
#[allow(clippy::needless_pass_by_value)]
const fn on(_: Crash) -> CrashLocation {}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{fault::RankCrash, index::IndexFile, storage::Storage};

	use tempfile::{tempdir, TempDir};

	fn disk() -> (TempDir, Disk) {
		let dir = tempdir().unwrap();
		let disk = Disk {
			index: IndexFile::create(dir.path(), 16, 0).unwrap(),
			storage: Storage::init(dir.path(), true).unwrap(),
		};
		(dir, disk)
	}

	fn new_node(disk: &mut Disk) -> Addr {
		let addr = disk.storage.create_block(FileType::Rankings, 1).unwrap();
		disk.store_node(addr, &RankingsNode::default()).unwrap();
		addr
	}

	fn insert(rankings: &Rankings, disk: &mut Disk, addr: Addr, now: i64) -> Result<(), Error> {
		let mut node = disk.load_node(addr).unwrap();
		rankings.insert(disk, addr, &mut node, true, now)
	}

	fn remove(rankings: &Rankings, disk: &mut Disk, addr: Addr) -> Result<Unlink, Error> {
		let mut node = disk.load_node(addr).unwrap();
		rankings.remove(disk, addr, &mut node)
	}

	fn walk(disk: &mut Disk, direction: Direction) -> Vec<Addr> {
		let mut out = vec![];
		let mut current = None;
		while let Some(next) = Rankings::next_of(disk, current, direction).unwrap() {
			out.push(next);
			current = Some(next);
			assert!(out.len() <= 64, "cycle in the list");
		}
		out
	}

	#[test]
	fn insert_and_remove_keep_both_directions_linked() {
		let (_dir, mut disk) = disk();
		let rankings = Rankings::default();

		let nodes = (0..4).map(|_| new_node(&mut disk)).collect::<Vec<_>>();
		for (now, &addr) in (1..).zip(&nodes) {
			insert(&rankings, &mut disk, addr, now).unwrap();
		}

		let newest_first = nodes.iter().rev().copied().collect::<Vec<_>>();
		assert_eq!(walk(&mut disk, Direction::Forward), newest_first);
		assert_eq!(walk(&mut disk, Direction::Backward), nodes);

		// Middle, head and tail.
		for addr in [nodes[1], nodes[3], nodes[0]] {
			assert!(matches!(
				remove(&rankings, &mut disk, addr),
				Ok(Unlink::Removed { .. })
			));
			assert!(!disk.load_node(addr).unwrap().is_linked());
		}

		assert_eq!(walk(&mut disk, Direction::Forward), vec![nodes[2]]);
		assert_eq!(disk.lru().transaction, Addr::NULL);

		remove(&rankings, &mut disk, nodes[2]).unwrap();
		assert!(!disk.lru().head.is_initialized());
		assert!(!disk.lru().tail.is_initialized());
		assert_eq!(remove(&rankings, &mut disk, nodes[2]).unwrap(), Unlink::NotLinked);
	}

	#[test]
	fn update_rank_moves_node_to_head() {
		let (_dir, mut disk) = disk();
		let rankings = Rankings::default();

		let nodes = (0..3).map(|_| new_node(&mut disk)).collect::<Vec<_>>();
		for (now, &addr) in (1..).zip(&nodes) {
			insert(&rankings, &mut disk, addr, now).unwrap();
		}

		let mut node = disk.load_node(nodes[0]).unwrap();
		rankings
			.update_rank(&mut disk, nodes[0], &mut node, false, 10)
			.unwrap();

		assert_eq!(
			walk(&mut disk, Direction::Forward),
			vec![nodes[0], nodes[2], nodes[1]]
		);

		let node = disk.load_node(nodes[0]).unwrap();
		assert_eq!(node.last_used, 10);
		assert_eq!(node.last_modified, 1);
	}

	#[test]
	fn broken_neighbour_orphans_node() {
		let (_dir, mut disk) = disk();
		let rankings = Rankings::default();

		let nodes = (0..3).map(|_| new_node(&mut disk)).collect::<Vec<_>>();
		for (now, &addr) in (1..).zip(&nodes) {
			insert(&rankings, &mut disk, addr, now).unwrap();
		}

		// The head no longer points to the middle node.
		let mut head = disk.load_node(nodes[2]).unwrap();
		head.next = nodes[0];
		disk.store_node(nodes[2], &head).unwrap();

		assert_eq!(remove(&rankings, &mut disk, nodes[1]).unwrap(), Unlink::Orphaned);
		assert_eq!(disk.lru().transaction, Addr::NULL);
	}

	/// Runs `op` with a crash at `crash`, then completes the transaction with
	/// a clean instance and returns the resulting list.
	fn crash_and_recover(
		len: usize,
		crash: RankCrash,
		op: impl FnOnce(&Rankings, &mut Disk, &[Addr]) -> Result<(), Error>,
	) -> (Vec<Addr>, Vec<Addr>) {
		let (dir, mut disk) = disk();
		let clean = Rankings::default();

		let nodes = (0..=len).map(|_| new_node(&mut disk)).collect::<Vec<_>>();
		for (now, &addr) in (1..).zip(&nodes[..len]) {
			insert(&clean, &mut disk, addr, now).unwrap();
		}

		let crashing = Rankings::with_injector(Some(Arc::new(crash)));
		assert!(matches!(
			op(&crashing, &mut disk, &nodes),
			Err(Error::InjectedCrash(location)) if location == crash.location()
		));
		drop(disk);

		// Only what made it to disk counts.
		let mut disk = Disk {
			index: IndexFile::open(dir.path()).unwrap(),
			storage: Storage::init(dir.path(), false).unwrap(),
		};
		assert!(disk.lru().transaction.is_initialized());

		clean.complete_transaction(&mut disk, 100).unwrap();
		assert_eq!(disk.lru().transaction, Addr::NULL);

		let forward = walk(&mut disk, Direction::Forward);
		let mut backward = walk(&mut disk, Direction::Backward);
		backward.reverse();
		assert_eq!(forward, backward);

		(forward, nodes)
	}

	#[test]
	fn interrupted_insert_is_finished() {
		for (crash, len) in [
			(RankCrash::InsertEmpty1, 0),
			(RankCrash::InsertEmpty2, 0),
			(RankCrash::InsertEmpty3, 0),
			(RankCrash::InsertOne1, 1),
			(RankCrash::InsertOne2, 1),
			(RankCrash::InsertOne3, 1),
			(RankCrash::InsertLoad1, 5),
			(RankCrash::InsertLoad2, 5),
		] {
			let (list, nodes) = crash_and_recover(len, crash, |rankings, disk, nodes| {
				insert(rankings, disk, nodes[len], 50)
			});

			assert_eq!(list.len(), len + 1, "{crash:?}");
			assert_eq!(list[0], nodes[len], "{crash:?}");
		}
	}

	#[test]
	fn interrupted_remove_is_reverted() {
		for (crash, len, victim) in [
			(RankCrash::RemoveOne1, 1, 0),
			(RankCrash::RemoveOne2, 1, 0),
			(RankCrash::RemoveOne3, 1, 0),
			(RankCrash::RemoveOne4, 1, 0),
			(RankCrash::RemoveHead1, 2, 1),
			(RankCrash::RemoveHead2, 2, 1),
			(RankCrash::RemoveHead3, 2, 1),
			(RankCrash::RemoveHead4, 2, 1),
			(RankCrash::RemoveTail1, 2, 0),
			(RankCrash::RemoveTail2, 2, 0),
			(RankCrash::RemoveTail3, 2, 0),
			(RankCrash::RemoveLoad1, 5, 2),
			(RankCrash::RemoveLoad2, 5, 2),
			(RankCrash::RemoveLoad3, 5, 2),
		] {
			let (list, nodes) = crash_and_recover(len, crash, |rankings, disk, nodes| {
				remove(rankings, disk, nodes[victim]).map(|_| ())
			});

			let expected = nodes[..len].iter().rev().copied().collect::<Vec<_>>();
			assert_eq!(list, expected, "{crash:?}");
		}
	}
}
