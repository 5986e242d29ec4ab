//! Whole cache copies, for maintenance and debugging.
//!
//! Both operations walk the source cache with an enumeration and read every
//! entry through the public API, so they work on any cache the backend can
//! open. Sparse children are not visited on their own: their payload is read
//! through the parent that owns them.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::{
	backend::Backend,
	entry::Entry,
	error::{Error, FileIOError},
	format::NUM_STREAMS,
	sparse::{CHILD_KEY_PREFIX, CHILD_SPAN, MAX_SPARSE_OFFSET},
};

/// Manifest file written next to the dumped streams.
pub const MANIFEST_NAME: &str = "manifest.json";

/// Sparse ranges are looked up this many bytes at a time.
const SPARSE_SCAN_WINDOW: u64 = 1 << 30;

/// What [`dump_to_dir`] wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
	pub entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
	/// The key, with invalid UTF-8 replaced.
	pub key: String,
	/// Common prefix of the files holding this entry's data.
	pub file_prefix: String,
	/// Length of each stream, zero for streams a sparse entry reserves.
	pub stream_sizes: [u32; NUM_STREAMS],
	/// Populated sparse ranges, concatenated in this order in the
	/// `<prefix>_sparse` file.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub sparse_ranges: Vec<SparseRange>,
	pub last_used: DateTime<Utc>,
	pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseRange {
	pub offset: u64,
	pub len: u64,
}

/// Everything stored for one entry.
struct Contents {
	/// `None` for streams holding sparse bookkeeping.
	streams: [Option<Vec<u8>>; NUM_STREAMS],
	sparse: Vec<(u64, Vec<u8>)>,
}

async fn read_contents(entry: &Entry) -> Result<Contents, Error> {
	let mut streams: [Option<Vec<u8>>; NUM_STREAMS] = Default::default();
	let mut is_sparse = false;

	for (stream, slot) in streams.iter_mut().enumerate() {
		let len = entry.data_size(stream) as usize;
		match entry.read_data(stream, 0, len).await {
			Ok(buf) => *slot = Some(buf),
			Err(Error::NotSupported) => is_sparse = true,
			Err(e) => return Err(e),
		}
	}

	let sparse = if is_sparse {
		read_sparse_ranges(entry).await?
	} else {
		Vec::new()
	};

	Ok(Contents { streams, sparse })
}

#[allow(clippy::cast_possible_truncation)]
async fn read_sparse_ranges(entry: &Entry) -> Result<Vec<(u64, Vec<u8>)>, Error> {
	let mut ranges = Vec::new();
	let mut pos = 0;

	while pos < MAX_SPARSE_OFFSET {
		let window = (MAX_SPARSE_OFFSET - pos).min(SPARSE_SCAN_WINDOW);
		let range = entry.get_available_range(pos, window as usize).await?;
		if range.len == 0 {
			pos += window;
			continue;
		}

		let mut data = Vec::with_capacity(range.len);
		while data.len() < range.len {
			let offset = range.start + data.len() as u64;
			let want = (range.len - data.len()).min(CHILD_SPAN as usize);
			let chunk = entry.read_sparse_data(offset, want).await?;
			if chunk.is_empty() {
				break;
			}
			data.extend_from_slice(&chunk);
		}

		pos = range.start + range.len as u64;
		ranges.push((range.start, data));
	}

	Ok(ranges)
}

async fn write_contents(entry: &Entry, contents: &Contents) -> Result<(), Error> {
	for (stream, data) in contents.streams.iter().enumerate() {
		if let Some(data) = data.as_ref().filter(|data| !data.is_empty()) {
			entry.write_data(stream, 0, data.clone(), true).await?;
		}
	}

	for (offset, data) in &contents.sparse {
		entry.write_sparse_data(*offset, data.clone()).await?;
	}

	Ok(())
}

fn is_sparse_child(entry: &Entry) -> bool {
	entry.key().starts_with(CHILD_KEY_PREFIX)
}

/// Recreates every entry of `src` in `dst` with the same data. Keys already
/// present in `dst` are left alone. Returns the number of entries copied.
#[instrument(skip_all)]
pub async fn copy_entries(src: &Backend, dst: &Backend) -> Result<usize, Error> {
	let iter = src.enumerate();
	let mut copied = 0;

	while let Some(entry) = src.open_next_entry(&iter).await? {
		if is_sparse_child(&entry) {
			continue;
		}

		let contents = read_contents(&entry).await?;

		let target = match dst.create_entry(entry.key()).await {
			Ok(target) => target,
			Err(Error::AlreadyExists) => {
				debug!(key = %String::from_utf8_lossy(entry.key()), "Skipping existing key");
				continue;
			}
			Err(e) => return Err(e),
		};

		write_contents(&target, &contents).await?;
		copied += 1;
	}

	info!(copied, "Copied cache entries");

	Ok(copied)
}

/// Writes every entry of `src` as flat files under `out`, plus a
/// [`MANIFEST_NAME`] describing them.
#[instrument(skip_all, fields(out = %out.as_ref().display()))]
pub async fn dump_to_dir(src: &Backend, out: impl AsRef<Path>) -> Result<Manifest, Error> {
	let out = out.as_ref();
	fs::create_dir_all(out)
		.await
		.map_err(|e| FileIOError::from((out, e, "Failed to create dump directory")))?;

	let iter = src.enumerate();
	let mut manifest = Manifest::default();

	while let Some(entry) = src.open_next_entry(&iter).await? {
		if is_sparse_child(&entry) {
			continue;
		}

		let contents = read_contents(&entry).await?;
		let file_prefix = format!("{:06}", manifest.entries.len());

		let mut stream_sizes = [0; NUM_STREAMS];
		for (stream, data) in contents.streams.iter().enumerate() {
			let Some(data) = data else {
				continue;
			};

			stream_sizes[stream] = entry.data_size(stream);
			write_file(out.join(format!("{file_prefix}_s{stream}")), data).await?;
		}

		let mut sparse_ranges = Vec::with_capacity(contents.sparse.len());
		if !contents.sparse.is_empty() {
			let mut payload = Vec::new();
			for (offset, data) in &contents.sparse {
				sparse_ranges.push(SparseRange {
					offset: *offset,
					len: data.len() as u64,
				});
				payload.extend_from_slice(data);
			}
			write_file(out.join(format!("{file_prefix}_sparse")), &payload).await?;
		}

		manifest.entries.push(ManifestEntry {
			key: String::from_utf8_lossy(entry.key()).into_owned(),
			file_prefix,
			stream_sizes,
			sparse_ranges,
			last_used: entry.last_used(),
			last_modified: entry.last_modified(),
		});
	}

	let path = out.join(MANIFEST_NAME);
	write_file(path, &serde_json::to_vec_pretty(&manifest)?).await?;

	if manifest.entries.is_empty() {
		warn!("Dumped an empty cache");
	} else {
		info!(entries = manifest.entries.len(), "Dumped cache entries");
	}

	Ok(manifest)
}

async fn write_file(path: PathBuf, data: &[u8]) -> Result<(), Error> {
	fs::write(&path, data)
		.await
		.map_err(|e| FileIOError::from((path, e, "Failed to write dump file")).into())
}
