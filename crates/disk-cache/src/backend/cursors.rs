use std::collections::HashMap;

use crate::{
	addr::Addr,
	rankings::{Direction, Unlink},
};

use super::message::IteratorId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Position {
	/// Nothing returned yet.
	Start,
	/// The node last returned.
	At(Addr),
	/// The node to return next, the one before it left the list.
	Ahead(Addr),
	End,
}

#[derive(Debug, Clone, Copy)]
pub(super) struct Cursor {
	pub direction: Direction,
	pub position: Position,
}

/// Positions of the enumerations in progress, kept valid as nodes leave
/// the list.
#[derive(Debug, Default)]
pub(super) struct Cursors(HashMap<IteratorId, Cursor>);

impl Cursors {
	/// The cursor for `id`, created at the start of the list on first use.
	/// Each step goes in the direction it was asked for.
	pub fn step(&mut self, id: IteratorId, direction: Direction) -> &mut Cursor {
		let cursor = self.0.entry(id).or_insert(Cursor {
			direction,
			position: Position::Start,
		});
		cursor.direction = direction;
		cursor
	}

	pub fn end(&mut self, id: IteratorId) {
		self.0.remove(&id);
	}

	pub fn reset(&mut self) {
		for cursor in self.0.values_mut() {
			cursor.position = Position::End;
		}
	}

	/// Moves cursors away from a node that just left the list, onto its
	/// successor in their own direction.
	pub fn on_unlink(&mut self, node: Addr, unlink: Unlink) {
		let Unlink::Removed { next, prev } = unlink else {
			return;
		};

		for cursor in self.0.values_mut() {
			if !matches!(cursor.position, Position::At(addr) | Position::Ahead(addr) if addr == node)
			{
				continue;
			}

			let successor = match cursor.direction {
				Direction::Forward => next,
				Direction::Backward => prev,
			};

			// The ends of the list link back to themselves.
			cursor.position = if successor == node || !successor.is_initialized() {
				Position::End
			} else {
				Position::Ahead(successor)
			};
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::addr::FileType;

	fn node(n: u16) -> Addr {
		Addr::new_block(FileType::Rankings, 1, 0, n)
	}

	#[test]
	fn cursor_skips_to_successor() {
		let mut cursors = Cursors::default();
		cursors.step(1, Direction::Forward).position = Position::At(node(2));
		cursors.step(2, Direction::Backward).position = Position::At(node(2));
		cursors.step(3, Direction::Forward).position = Position::At(node(7));

		cursors.on_unlink(
			node(2),
			Unlink::Removed {
				next: node(3),
				prev: node(1),
			},
		);

		assert_eq!(cursors.step(1, Direction::Forward).position, Position::Ahead(node(3)));
		assert_eq!(cursors.step(2, Direction::Backward).position, Position::Ahead(node(1)));
		assert_eq!(cursors.step(3, Direction::Forward).position, Position::At(node(7)));
	}

	#[test]
	fn cursor_on_removed_tail_ends() {
		let mut cursors = Cursors::default();
		cursors.step(1, Direction::Forward).position = Position::Ahead(node(4));

		cursors.on_unlink(
			node(4),
			Unlink::Removed {
				next: node(4),
				prev: node(3),
			},
		);

		assert_eq!(cursors.step(1, Direction::Forward).position, Position::End);
	}

	#[test]
	fn orphaned_nodes_keep_cursors() {
		let mut cursors = Cursors::default();
		cursors.step(1, Direction::Forward).position = Position::At(node(4));

		cursors.on_unlink(node(4), Unlink::Orphaned);

		assert_eq!(cursors.step(1, Direction::Forward).position, Position::At(node(4)));
	}
}
