/// Event counters kept by the worker for the lifetime of one backend.
#[derive(Debug, Default, Clone)]
pub(crate) struct Stats {
	pub create_hit: u64,
	pub create_miss: u64,
	pub open_hit: u64,
	pub open_miss: u64,
	pub doom_entry: u64,
	pub doom_cache: u64,
	pub doom_recent: u64,
	pub trim_entry: u64,
	pub invalid_entry: u64,
}

/// Gauges sampled when a report is requested.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Gauges {
	pub entries: u32,
	pub pending_io: usize,
	pub max_bytes: u64,
	pub num_bytes: u64,
	pub open_entries: usize,
}

impl Stats {
	/// Name and value pairs, gauges first.
	pub fn report(&self, gauges: Gauges) -> Vec<(String, String)> {
		let Gauges {
			entries,
			pending_io,
			max_bytes,
			num_bytes,
			open_entries,
		} = gauges;

		[
			("Entries", entries.to_string()),
			("Pending IO", pending_io.to_string()),
			("Max size", max_bytes.to_string()),
			("Current size", num_bytes.to_string()),
			("Create hit", self.create_hit.to_string()),
			("Create miss", self.create_miss.to_string()),
			("Open hit", self.open_hit.to_string()),
			("Open miss", self.open_miss.to_string()),
			("Doom entry", self.doom_entry.to_string()),
			("Doom cache", self.doom_cache.to_string()),
			("Doom recent", self.doom_recent.to_string()),
			("Trim entry", self.trim_entry.to_string()),
			("Invalid entry", self.invalid_entry.to_string()),
			("Open entries", open_entries.to_string()),
		]
		.into_iter()
		.map(|(name, value)| (name.to_owned(), value))
		.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn report_lists_gauges_then_counters() {
		let stats = Stats {
			open_hit: 3,
			trim_entry: 1,
			..Default::default()
		};

		let report = stats.report(Gauges {
			entries: 5,
			pending_io: 0,
			max_bytes: 1024,
			num_bytes: 512,
			open_entries: 2,
		});

		assert_eq!(report.len(), 14);
		assert_eq!(report[0], ("Entries".to_owned(), "5".to_owned()));
		assert!(report.contains(&("Open hit".to_owned(), "3".to_owned())));
		assert!(report.contains(&("Trim entry".to_owned(), "1".to_owned())));
		assert_eq!(report[13], ("Open entries".to_owned(), "2".to_owned()));
	}
}
