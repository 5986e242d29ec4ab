//! Crash point injection for the rankings list.
//!
//! Every structural list mutation is split into small writes, and each write
//! is followed by a [`CrashLocation`]. A [`FaultInjector`] handed to the
//! backend decides whether execution should stop right there, leaving the
//! directory exactly as a process crash would.

use std::fmt;

/// Points inside list mutations where execution can be interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashLocation {
	/// Insert: the old head now points back to the new node.
	OnInsert1,
	/// Insert: the tail was written, only when inserting into an empty list.
	OnInsert2,
	/// Insert: the new node itself was written.
	OnInsert3,
	/// Insert: the head was written, the list is consistent again.
	OnInsert4,
	/// Remove: transaction recorded, nothing else written yet.
	OnRemove1,
	/// Remove of the only node: head cleared.
	OnRemove2,
	/// Remove of the only node: tail cleared.
	OnRemove3,
	/// Remove of the head: new head written.
	OnRemove4,
	/// Remove of the tail: new tail written.
	OnRemove5,
	/// Remove of the tail: new tail node written.
	OnRemove6,
	/// Remove: next node written.
	OnRemove7,
	/// Remove: previous node written.
	OnRemove8,
}

/// Strategy deciding whether to crash at a given location.
pub trait FaultInjector: fmt::Debug + Send + Sync + 'static {
	fn should_crash(&self, location: CrashLocation) -> bool;
}

/// The named recovery scenarios, each one crashes at one step of one kind
/// of list mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RankCrash {
	InsertEmpty1,
	InsertEmpty2,
	InsertEmpty3,
	InsertOne1,
	InsertOne2,
	InsertOne3,
	InsertLoad1,
	InsertLoad2,
	RemoveOne1,
	RemoveOne2,
	RemoveOne3,
	RemoveOne4,
	RemoveHead1,
	RemoveHead2,
	RemoveHead3,
	RemoveHead4,
	RemoveTail1,
	RemoveTail2,
	RemoveTail3,
	RemoveLoad1,
	RemoveLoad2,
	RemoveLoad3,
}

impl RankCrash {
	pub const ALL: [Self; 22] = [
		Self::InsertEmpty1,
		Self::InsertEmpty2,
		Self::InsertEmpty3,
		Self::InsertOne1,
		Self::InsertOne2,
		Self::InsertOne3,
		Self::InsertLoad1,
		Self::InsertLoad2,
		Self::RemoveOne1,
		Self::RemoveOne2,
		Self::RemoveOne3,
		Self::RemoveOne4,
		Self::RemoveHead1,
		Self::RemoveHead2,
		Self::RemoveHead3,
		Self::RemoveHead4,
		Self::RemoveTail1,
		Self::RemoveTail2,
		Self::RemoveTail3,
		Self::RemoveLoad1,
		Self::RemoveLoad2,
		Self::RemoveLoad3,
	];

	#[must_use]
	pub const fn is_insert(self) -> bool {
		matches!(
			self,
			Self::InsertEmpty1
				| Self::InsertEmpty2
				| Self::InsertEmpty3
				| Self::InsertOne1
				| Self::InsertOne2
				| Self::InsertOne3
				| Self::InsertLoad1
				| Self::InsertLoad2
		)
	}

	/// Location this scenario stops at.
	#[must_use]
	pub const fn location(self) -> CrashLocation {
		use CrashLocation::{
			OnInsert1, OnInsert2, OnInsert3, OnInsert4, OnRemove1, OnRemove2, OnRemove3,
			OnRemove4, OnRemove5, OnRemove6, OnRemove7, OnRemove8,
		};

		match self {
			Self::InsertOne1 | Self::InsertLoad1 => OnInsert1,
			Self::InsertEmpty1 => OnInsert2,
			Self::InsertEmpty2 | Self::InsertOne2 | Self::InsertLoad2 => OnInsert3,
			Self::InsertEmpty3 | Self::InsertOne3 => OnInsert4,
			Self::RemoveOne1 | Self::RemoveHead1 | Self::RemoveTail1 | Self::RemoveLoad1 => OnRemove1,
			Self::RemoveOne2 => OnRemove2,
			Self::RemoveOne3 => OnRemove3,
			Self::RemoveHead2 => OnRemove4,
			Self::RemoveTail2 => OnRemove5,
			Self::RemoveTail3 => OnRemove6,
			Self::RemoveOne4 | Self::RemoveLoad2 | Self::RemoveHead3 => OnRemove7,
			Self::RemoveHead4 | Self::RemoveLoad3 => OnRemove8,
		}
	}
}

impl FaultInjector for RankCrash {
	fn should_crash(&self, location: CrashLocation) -> bool {
		self.location() == location
	}
}
