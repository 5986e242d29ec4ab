use tracing::{trace, warn};

use crate::{
	entry::Entry,
	error::Error,
	rankings::{Direction, Rankings},
};

use super::{cursors::Position, imp::BackendImpl, message::IteratorId};

impl BackendImpl {
	/// Opens the entry after the cursor's position. Enumerating doesn't count
	/// as using the entries, and damaged ones are skipped.
	pub fn open_next(
		&mut self,
		iterator: IteratorId,
		direction: Direction,
	) -> Result<Option<Entry>, Error> {
		loop {
			let position = self.cursors.step(iterator, direction).position;

			let next = match position {
				Position::Start => Rankings::next_of(&mut self.disk, None, direction),
				Position::At(node) => Rankings::next_of(&mut self.disk, Some(node), direction),
				Position::Ahead(node) => Ok(Some(node)),
				Position::End => Ok(None),
			};

			let node_addr = match next {
				Ok(Some(node_addr)) => node_addr,
				Ok(None) => {
					self.cursors.step(iterator, direction).position = Position::End;
					return Ok(None);
				}
				Err(Error::Corrupted(reason)) => {
					warn!(%reason, "Enumeration stopped at a damaged node");
					self.cursors.step(iterator, direction).position = Position::End;
					return Ok(None);
				}
				Err(e) => return Err(e),
			};

			self.cursors.step(iterator, direction).position = Position::At(node_addr);

			let addr = match self.disk.load_node(node_addr) {
				Ok(node) => node.contents,
				Err(Error::Corrupted(reason)) => {
					warn!(%reason, "Enumeration stopped at a damaged node");
					self.cursors.step(iterator, direction).position = Position::End;
					return Ok(None);
				}
				Err(e) => return Err(e),
			};

			match self.with_internal(addr, |this| this.user_handle(addr)) {
				Ok(entry) => {
					trace!(%addr, iterator, "Enumerated entry");
					return Ok(Some(entry));
				}
				Err(Error::Corrupted(reason)) => {
					warn!(%addr, %reason, "Skipping damaged entry during enumeration");
					self.stats.invalid_entry += 1;
				}
				Err(e) => return Err(e),
			}
		}
	}
}
