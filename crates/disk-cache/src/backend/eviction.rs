use tracing::{debug, instrument, warn};

use crate::error::Error;

use super::imp::BackendImpl;

impl BackendImpl {
	pub fn trim_if_needed(&mut self) -> Result<(), Error> {
		if self.disk.header().num_bytes > self.max_bytes {
			self.trim()
		} else {
			Ok(())
		}
	}

	/// Evicts from the tail until the cache is 5% under its budget. Open
	/// entries found at the tail are moved to the head instead.
	#[instrument(
		skip(self),
		fields(num_bytes = self.disk.header().num_bytes, max_bytes = self.max_bytes)
	)]
	fn trim(&mut self) -> Result<(), Error> {
		let target = self.max_bytes - self.max_bytes / 20;
		let budget = self.disk.header().num_entries as usize + self.open.len();

		let mut visited = 0;
		let mut trimmed = 0_u64;

		while self.disk.header().num_bytes > target && visited < budget {
			visited += 1;

			let tail = self.disk.lru().tail;
			if !tail.is_initialized() {
				break;
			}

			let addr = match self.disk.load_node(tail) {
				Ok(node) => node.contents,
				Err(Error::Corrupted(reason)) => {
					warn!(%tail, %reason, "Eviction stopped at a damaged node");
					break;
				}
				Err(e) => return Err(e),
			};

			if self.open.contains_key(&addr) {
				self.touch(addr, false)?;
				continue;
			}

			match self.with_internal(addr, |this| this.doom_open(addr)) {
				Ok(()) => trimmed += 1,
				Err(Error::Corrupted(reason)) => {
					warn!(%addr, %reason, "Eviction stopped at a damaged entry");
					self.stats.invalid_entry += 1;
					break;
				}
				Err(e) => return Err(e),
			}
		}

		self.stats.trim_entry += trimmed;
		debug!(trimmed, num_bytes = self.disk.header().num_bytes, "Trimmed cache");

		Ok(())
	}
}
