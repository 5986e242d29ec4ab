use sd_disk_cache::{Backend, BackendConfig, Error};

use std::time::Duration;

use chrono::Utc;
use futures_concurrency::future::Join;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tempfile::tempdir;
use tokio::time::sleep;
use tracing_test::traced_test;

mod common;

use common::{config, create_with, keys_in_order, open, payload, read_all, stat};

#[tokio::test]
#[traced_test]
async fn entries_survive_reopen() {
	let dir = tempdir().unwrap();
	let data = payload(1, 3000);

	let backend = open(dir.path()).await;
	create_with(&backend, "persistent", 0, &data).await;
	create_with(&backend, "another one", 1, b"small").await;
	backend.shutdown().await.unwrap();

	let backend = open(dir.path()).await;
	assert_eq!(backend.entry_count(), 2);
	assert_eq!(backend.self_check().await.unwrap(), 2);

	let entry = backend.open_entry("persistent").await.unwrap();
	assert_eq!(entry.data_size(0), 3000);
	assert_eq!(read_all(&entry, 0).await, data);

	let entry = backend.open_entry("another one").await.unwrap();
	assert_eq!(read_all(&entry, 1).await, b"small");

	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn create_and_open_report_conflicts() {
	let dir = tempdir().unwrap();
	let backend = open(dir.path()).await;

	assert!(matches!(
		backend.open_entry("missing").await,
		Err(Error::NotFound)
	));

	let entry = backend.create_entry("key").await.unwrap();
	assert!(matches!(
		backend.create_entry("key").await,
		Err(Error::AlreadyExists)
	));

	let again = backend.open_entry("key").await.unwrap();
	assert_eq!(entry, again, "an open entry hands out the same handle");

	assert_eq!(stat(&backend, "Create hit").await, 1);
	assert_eq!(stat(&backend, "Create miss").await, 1);
	assert_eq!(stat(&backend, "Open hit").await, 1);
	assert_eq!(stat(&backend, "Open miss").await, 1);
	assert_eq!(stat(&backend, "Open entries").await, 1);

	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn doomed_entry_stays_usable_through_open_handles() {
	let dir = tempdir().unwrap();
	let backend = open(dir.path()).await;

	let entry = create_with(&backend, "doomed", 0, b"still here").await;
	backend.doom_entry("doomed").await.unwrap();

	assert!(entry.is_doomed());
	assert_eq!(backend.entry_count(), 0);
	assert!(matches!(
		backend.open_entry("doomed").await,
		Err(Error::NotFound)
	));
	assert_eq!(read_all(&entry, 0).await, b"still here");

	// The key is free again while the old handle lives on.
	let fresh = create_with(&backend, "doomed", 0, b"new data").await;
	assert_eq!(read_all(&entry, 0).await, b"still here");
	assert_eq!(read_all(&fresh, 0).await, b"new data");

	drop(entry);
	assert_eq!(backend.self_check().await.unwrap(), 1);

	assert!(matches!(
		backend.doom_entry("never created").await,
		Err(Error::NotFound)
	));

	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn doom_all_entries() {
	let dir = tempdir().unwrap();
	let backend = open(dir.path()).await;

	for n in 0..5 {
		create_with(&backend, &format!("key {n}"), 0, &payload(n, 500)).await;
	}
	backend.doom_all_entries().await.unwrap();
	assert_eq!(backend.entry_count(), 0);
	assert_eq!(backend.self_check().await.unwrap(), 0);

	// With an entry open the cache can't start over, every entry is doomed
	// one by one instead.
	let held = create_with(&backend, "held", 0, b"held").await;
	create_with(&backend, "other", 0, b"other").await;
	backend.doom_all_entries().await.unwrap();

	assert!(held.is_doomed());
	assert_eq!(backend.entry_count(), 0);
	assert_eq!(read_all(&held, 0).await, b"held");
	assert_eq!(stat(&backend, "Doom cache").await, 2);

	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn doom_entries_by_last_use() {
	let dir = tempdir().unwrap();
	let backend = open(dir.path()).await;

	create_with(&backend, "old", 0, b"old").await;
	sleep(Duration::from_millis(5)).await;
	let initial = Utc::now();
	sleep(Duration::from_millis(5)).await;
	create_with(&backend, "middle", 0, b"middle").await;
	sleep(Duration::from_millis(5)).await;
	let end = Utc::now();
	sleep(Duration::from_millis(5)).await;
	create_with(&backend, "new", 0, b"new").await;

	backend.doom_entries_between(initial, end).await.unwrap();
	assert_eq!(keys_in_order(&backend).await, ["new", "old"]);

	backend.doom_entries_since(initial).await.unwrap();
	assert_eq!(keys_in_order(&backend).await, ["old"]);
	assert_eq!(stat(&backend, "Doom recent").await, 2);

	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn enumeration_follows_recency_in_both_directions() {
	let dir = tempdir().unwrap();
	let backend = open(dir.path()).await;

	for n in 0..4 {
		create_with(&backend, &format!("key {n}"), 0, b"data").await;
	}
	assert_eq!(
		keys_in_order(&backend).await,
		["key 3", "key 2", "key 1", "key 0"]
	);

	let iter = backend.enumerate();
	let mut backwards = Vec::new();
	while let Some(entry) = backend.open_prev_entry(&iter).await.unwrap() {
		backwards.push(String::from_utf8(entry.key().to_vec()).unwrap());
	}
	assert_eq!(backwards, ["key 0", "key 1", "key 2", "key 3"]);
	assert!(backend.open_prev_entry(&iter).await.unwrap().is_none());
	backend.end_enumeration(iter);

	// Opening counts as a use, enumerating doesn't.
	backend.open_entry("key 1").await.unwrap();
	backend.on_external_cache_hit("key 0");
	backend.on_external_cache_hit("not in the cache");
	assert_eq!(
		keys_in_order(&backend).await,
		["key 0", "key 1", "key 3", "key 2"]
	);

	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn enumeration_survives_dooms() {
	let dir = tempdir().unwrap();
	let backend = open(dir.path()).await;

	for n in 0..5 {
		create_with(&backend, &format!("key {n}"), 0, b"data").await;
	}

	let iter = backend.enumerate();
	let first = backend.open_next_entry(&iter).await.unwrap().unwrap();
	assert_eq!(first.key(), b"key 4");

	// Dooming the entry the iterator sits on moves it along.
	first.doom().await.unwrap();
	let second = backend.open_next_entry(&iter).await.unwrap().unwrap();
	assert_eq!(second.key(), b"key 3");

	backend.doom_entry("key 2").await.unwrap();
	let third = backend.open_next_entry(&iter).await.unwrap().unwrap();
	assert_eq!(third.key(), b"key 1");

	let fourth = backend.open_next_entry(&iter).await.unwrap().unwrap();
	assert_eq!(fourth.key(), b"key 0");
	assert!(backend.open_next_entry(&iter).await.unwrap().is_none());

	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn invalid_arguments_are_rejected_up_front() {
	let dir = tempdir().unwrap();

	assert!(matches!(
		Backend::open(BackendConfig::new(dir.path()).with_table_len(1000)).await,
		Err(Error::InvalidArgument(_))
	));
	assert!(matches!(
		Backend::open(BackendConfig::new("")).await,
		Err(Error::InvalidArgument(_))
	));

	let backend = open(dir.path()).await;
	assert!(matches!(
		backend.set_max_size(0).await,
		Err(Error::InvalidArgument(_))
	));
	backend.set_max_size(1 << 20).await.unwrap();
	assert_eq!(stat(&backend, "Max size").await, 1 << 20);

	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn operations_after_shutdown_fail() {
	let dir = tempdir().unwrap();
	let backend = open(dir.path()).await;
	let entry = create_with(&backend, "key", 0, b"data").await;

	backend.shutdown().await.unwrap();
	// A second shutdown only warns.
	backend.shutdown().await.unwrap();

	assert!(matches!(
		backend.create_entry("late").await,
		Err(Error::Shutdown)
	));
	assert!(matches!(
		entry.read_data(0, 0, 4).await,
		Err(Error::Shutdown)
	));

	drop(entry);

	let backend = open(dir.path()).await;
	assert_eq!(read_all(&backend.open_entry("key").await.unwrap(), 0).await, b"data");
	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn entry_operations_queued_before_shutdown_still_run() {
	let dir = tempdir().unwrap();
	let backend = open(dir.path()).await;
	let entry = backend.create_entry("queued").await.unwrap();

	let write = entry.write_data(0, 0, b"written during shutdown".to_vec(), true);
	let shutdown = backend.shutdown();

	let (written, shutdown) = tokio::join!(write, shutdown);
	assert_eq!(written.unwrap(), 23);
	shutdown.unwrap();
	drop(entry);

	let backend = open(dir.path()).await;
	let entry = backend.open_entry("queued").await.unwrap();
	assert_eq!(read_all(&entry, 0).await, b"written during shutdown");
	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn dropping_the_backend_closes_the_cache() {
	let dir = tempdir().unwrap();

	let backend = Backend::open(config(dir.path())).await.unwrap();
	create_with(&backend, "key", 0, b"data").await;
	drop(backend);

	// The worker may still be flushing, a clean reopen waits for nothing.
	sleep(Duration::from_millis(100)).await;

	let backend = open(dir.path()).await;
	assert_eq!(backend.self_check().await.unwrap(), 1);
	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn config_round_trips_through_json() {
	let dir = tempdir().unwrap();
	let path = dir.path().join("cache.json");

	let config = BackendConfig::new(dir.path().join("cache"))
		.with_max_bytes(4 << 20)
		.with_sparse(false);
	config.save(&path).unwrap();

	let loaded = BackendConfig::load(&path).unwrap();
	assert_eq!(loaded.effective_max_bytes(), 4 << 20);
	assert!(!loaded.sparse_enabled);

	let backend = Backend::open(loaded).await.unwrap();
	assert_eq!(stat(&backend, "Max size").await, 4 << 20);
	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn operations_run_in_issue_order() {
	let dir = tempdir().unwrap();
	let backend = open(dir.path()).await;

	let (first, second, doom) = (
		backend.create_entry("contested"),
		backend.create_entry("contested"),
		backend.doom_entry("contested"),
	)
		.join()
		.await;

	let first = first.unwrap();
	assert!(matches!(second, Err(Error::AlreadyExists)));
	doom.unwrap();
	assert!(first.is_doomed());
	assert_eq!(backend.entry_count(), 0);

	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn cold_reopen_reads_what_was_written() {
	const ENTRIES: u64 = 1000;
	const CHUNK: usize = 3000;

	let dir = tempdir().unwrap();
	let mut rng = StdRng::seed_from_u64(0x5eed);
	let sizes = (0..ENTRIES)
		.map(|_| rng.gen_range(0..16_384))
		.collect::<Vec<usize>>();

	let backend = open(dir.path()).await;
	for (n, &size) in sizes.iter().enumerate() {
		let entry = backend.create_entry(format!("entry {n}")).await.unwrap();
		let data = payload(n as u64, size);
		for (i, chunk) in data.chunks(CHUNK).enumerate() {
			entry
				.write_data(1, (i * CHUNK) as u64, chunk.to_vec(), false)
				.await
				.unwrap();
		}
	}
	backend.shutdown().await.unwrap();

	let backend = open(dir.path()).await;
	assert_eq!(u64::from(backend.entry_count()), ENTRIES);
	for (n, &size) in sizes.iter().enumerate() {
		let entry = backend.open_entry(format!("entry {n}")).await.unwrap();
		assert_eq!(entry.data_size(1) as usize, size, "entry {n}");
		assert_eq!(read_all(&entry, 1).await, payload(n as u64, size), "entry {n}");
	}
	assert_eq!(u64::from(backend.self_check().await.unwrap()), ENTRIES);

	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn unusable_directory_needs_force() {
	let dir = tempdir().unwrap();

	let backend = open(dir.path()).await;
	create_with(&backend, "key", 0, b"data").await;
	backend.shutdown().await.unwrap();

	std::fs::write(dir.path().join("index"), b"definitely not an index").unwrap();

	assert!(matches!(
		Backend::open(config(dir.path())).await,
		Err(Error::Corrupted(_))
	));

	let backend = Backend::open(config(dir.path()).with_force(true))
		.await
		.unwrap();
	assert_eq!(backend.entry_count(), 0);
	assert!(matches!(
		backend.open_entry("key").await,
		Err(Error::NotFound)
	));
	create_with(&backend, "key", 0, b"fresh").await;
	assert_eq!(backend.self_check().await.unwrap(), 1);

	backend.shutdown().await.unwrap();
}
