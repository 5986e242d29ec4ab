#![allow(dead_code)]

use std::path::Path;

use rand::{rngs::StdRng, Rng, SeedableRng};
use sd_disk_cache::{Backend, BackendConfig, Entry};

pub const SMALL_TABLE: u32 = 64;

pub fn config(dir: &Path) -> BackendConfig {
	BackendConfig::new(dir).with_table_len(SMALL_TABLE)
}

pub async fn open(dir: &Path) -> Backend {
	Backend::open(config(dir)).await.unwrap()
}

/// Deterministic pseudo random bytes, different for each `seed`.
pub fn payload(seed: u64, len: usize) -> Vec<u8> {
	let mut rng = StdRng::seed_from_u64(seed);
	let mut buf = vec![0; len];
	rng.fill(buf.as_mut_slice());
	buf
}

pub async fn create_with(backend: &Backend, key: &str, stream: usize, data: &[u8]) -> Entry {
	let entry = backend.create_entry(key).await.unwrap();
	assert_eq!(
		entry.write_data(stream, 0, data.to_vec(), true).await.unwrap(),
		data.len()
	);
	entry
}

pub async fn read_all(entry: &Entry, stream: usize) -> Vec<u8> {
	let len = entry.data_size(stream) as usize;
	entry.read_data(stream, 0, len).await.unwrap()
}

/// Keys in enumeration order, most recently used first.
pub async fn keys_in_order(backend: &Backend) -> Vec<String> {
	let iter = backend.enumerate();
	let mut keys = Vec::new();
	while let Some(entry) = backend.open_next_entry(&iter).await.unwrap() {
		keys.push(String::from_utf8(entry.key().to_vec()).unwrap());
	}
	keys
}

pub async fn stat(backend: &Backend, name: &str) -> u64 {
	backend
		.stats()
		.await
		.unwrap()
		.into_iter()
		.find(|(row, _)| row == name)
		.map(|(_, value)| value.parse().unwrap())
		.unwrap()
}
