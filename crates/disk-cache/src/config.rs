//! Backend configuration.

use std::{
	fs,
	path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
	error::{Error, FileIOError},
	index::desired_table_len,
};

/// Size budget used when none is configured.
pub const DEFAULT_MAX_BYTES: u64 = 80 * 1024 * 1024;

const MAX_TABLE_LEN: u32 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
	/// Directory holding the cache files, created if missing.
	pub path: PathBuf,
	/// Size budget in bytes, zero picks [`DEFAULT_MAX_BYTES`].
	pub max_bytes: u64,
	/// Wipe the directory and start over when its content can't be used.
	pub force: bool,
	/// Hash table length for a new cache, derived from the size budget when
	/// unset. Existing caches keep the length they were created with.
	pub table_len: Option<u32>,
	pub sparse_enabled: bool,
}

impl Default for BackendConfig {
	fn default() -> Self {
		Self {
			path: PathBuf::new(),
			max_bytes: 0,
			force: false,
			table_len: None,
			sparse_enabled: true,
		}
	}
}

impl BackendConfig {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			..Default::default()
		}
	}

	#[must_use]
	pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
		self.max_bytes = max_bytes;
		self
	}

	#[must_use]
	pub fn with_force(mut self, force: bool) -> Self {
		self.force = force;
		self
	}

	#[must_use]
	pub fn with_table_len(mut self, table_len: u32) -> Self {
		self.table_len = Some(table_len);
		self
	}

	#[must_use]
	pub fn with_sparse(mut self, enabled: bool) -> Self {
		self.sparse_enabled = enabled;
		self
	}

	/// Reads a configuration saved as JSON.
	pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
		let path = path.as_ref();
		let json = fs::read_to_string(path)
			.map_err(|e| FileIOError::from((path, e, "Failed to read backend config")))?;

		Ok(serde_json::from_str(&json)?)
	}

	pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
		let path = path.as_ref();
		fs::write(path, serde_json::to_string_pretty(self)?)
			.map_err(|e| FileIOError::from((path, e, "Failed to write backend config")))?;

		info!(path = %path.display(), "Saved backend config");
		Ok(())
	}

	#[must_use]
	pub const fn effective_max_bytes(&self) -> u64 {
		if self.max_bytes == 0 {
			DEFAULT_MAX_BYTES
		} else {
			self.max_bytes
		}
	}

	pub(crate) fn effective_table_len(&self) -> u32 {
		self.table_len
			.unwrap_or_else(|| desired_table_len(self.effective_max_bytes()))
	}

	pub(crate) fn validate(&self) -> Result<(), Error> {
		if self.path.as_os_str().is_empty() {
			return Err(Error::InvalidArgument("cache path is empty"));
		}

		if let Some(table_len) = self.table_len {
			if !table_len.is_power_of_two() || table_len > MAX_TABLE_LEN {
				return Err(Error::InvalidArgument(
					"table length must be a power of two no larger than 2^20",
				));
			}
		}

		Ok(())
	}
}
