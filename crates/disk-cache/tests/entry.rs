use sd_disk_cache::{Backend, Error};

use tempfile::tempdir;
use tracing_test::traced_test;

mod common;

use common::{config, create_with, open, payload, read_all, stat};

#[tokio::test]
#[traced_test]
async fn streams_are_independent() {
	let dir = tempdir().unwrap();
	let backend = open(dir.path()).await;

	let entry = backend.create_entry("three streams").await.unwrap();
	for stream in 0..3 {
		let data = payload(stream as u64, 100 * (stream + 1));
		entry.write_data(stream, 0, data, true).await.unwrap();
	}

	for stream in 0..3 {
		assert_eq!(entry.data_size(stream), 100 * (stream as u32 + 1));
		assert_eq!(
			read_all(&entry, stream).await,
			payload(stream as u64, 100 * (stream + 1))
		);
	}
	assert_eq!(entry.data_size(7), 0);

	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn partial_writes_and_truncation() {
	let dir = tempdir().unwrap();
	let backend = open(dir.path()).await;
	let entry = create_with(&backend, "partial", 0, b"hello world").await;

	entry.write_data(0, 6, b"there".to_vec(), false).await.unwrap();
	assert_eq!(read_all(&entry, 0).await, b"hello there");

	entry.write_data(0, 0, b"HE".to_vec(), false).await.unwrap();
	assert_eq!(read_all(&entry, 0).await, b"HEllo there");

	entry.write_data(0, 2, b"y".to_vec(), true).await.unwrap();
	assert_eq!(read_all(&entry, 0).await, b"HEy");
	assert_eq!(entry.data_size(0), 3);

	// Reads are clamped to the stream.
	assert_eq!(entry.read_data(0, 1, 100).await.unwrap(), b"Ey");
	assert!(entry.read_data(0, 50, 10).await.unwrap().is_empty());

	entry.write_data(0, 0, Vec::new(), true).await.unwrap();
	assert_eq!(entry.data_size(0), 0);

	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn writing_past_the_end_zero_fills() {
	let dir = tempdir().unwrap();
	let backend = open(dir.path()).await;
	let entry = create_with(&backend, "gap", 1, b"abc").await;

	entry.write_data(1, 100, b"x".to_vec(), false).await.unwrap();

	let data = read_all(&entry, 1).await;
	assert_eq!(data.len(), 101);
	assert_eq!(&data[..3], b"abc");
	assert!(data[3..100].iter().all(|&b| b == 0));
	assert_eq!(data[100], b'x');

	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn streams_move_between_storage_classes() {
	let dir = tempdir().unwrap();
	let backend = open(dir.path()).await;
	let entry = backend.create_entry("growing").await.unwrap();

	for (seed, len) in [100, 2_000, 8_000, 40_000, 700, 20_000, 0].into_iter().enumerate() {
		let data = payload(seed as u64, len);
		entry.write_data(0, 0, data.clone(), true).await.unwrap();
		assert_eq!(read_all(&entry, 0).await, data, "len {len}");
	}

	// Appending keeps what was there when the stream changes class.
	let head = payload(10, 500);
	let tail = payload(11, 20_000);
	entry.write_data(2, 0, head.clone(), true).await.unwrap();
	entry.write_data(2, 500, tail.clone(), false).await.unwrap();
	assert_eq!(read_all(&entry, 2).await, [head, tail].concat());

	drop(entry);
	backend.shutdown().await.unwrap();

	let backend = open(dir.path()).await;
	let entry = backend.open_entry("growing").await.unwrap();
	assert_eq!(entry.data_size(0), 0);
	assert_eq!(entry.data_size(2), 20_500);
	assert_eq!(backend.self_check().await.unwrap(), 1);
	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn long_keys() {
	let dir = tempdir().unwrap();
	let backend = open(dir.path()).await;

	let medium = "m".repeat(2_000);
	let huge = "h".repeat(30_000);

	create_with(&backend, &medium, 0, b"medium").await;
	create_with(&backend, &huge, 0, b"huge").await;
	backend.shutdown().await.unwrap();

	let backend = open(dir.path()).await;
	let entry = backend.open_entry(medium.as_str()).await.unwrap();
	assert_eq!(entry.key(), medium.as_bytes());
	assert_eq!(read_all(&entry, 0).await, b"medium");

	let entry = backend.open_entry(huge.as_str()).await.unwrap();
	assert_eq!(entry.key().len(), 30_000);
	assert_eq!(read_all(&entry, 0).await, b"huge");

	backend.doom_entry(huge.as_str()).await.unwrap();
	drop(entry);
	assert_eq!(backend.self_check().await.unwrap(), 1);

	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn invalid_io_is_rejected() {
	let dir = tempdir().unwrap();
	let backend = Backend::open(config(dir.path()).with_max_bytes(1 << 20))
		.await
		.unwrap();
	let entry = backend.create_entry("limits").await.unwrap();

	assert!(matches!(
		entry.write_data(3, 0, b"x".to_vec(), true).await,
		Err(Error::InvalidArgument(_))
	));
	assert!(matches!(
		entry.read_data(0, u64::from(u32::MAX) + 1, 1).await,
		Err(Error::InvalidArgument(_))
	));

	// A single stream may take an eighth of the budget.
	assert!(matches!(
		entry.write_data(0, 0, vec![0; 200 * 1024], true).await,
		Err(Error::EntryTooLarge { max, .. }) if max == 128 * 1024
	));
	entry.write_data(0, 0, vec![1; 100 * 1024], true).await.unwrap();
	assert!(matches!(
		entry.write_data(0, 120 * 1024, vec![2; 16 * 1024], false).await,
		Err(Error::EntryTooLarge { .. })
	));
	assert_eq!(entry.data_size(0), 100 * 1024);

	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn handles_share_state() {
	let dir = tempdir().unwrap();
	let backend = open(dir.path()).await;

	let entry = backend.create_entry("shared").await.unwrap();
	let clone = entry.clone();
	let created = entry.last_modified();

	drop(entry);
	clone.write_data(0, 0, b"through the clone".to_vec(), true).await.unwrap();

	let reopened = backend.open_entry("shared").await.unwrap();
	assert_eq!(reopened, clone);
	assert_eq!(reopened.data_size(0), 17);
	assert!(reopened.last_modified() > created);
	assert!(reopened.last_used() >= reopened.last_modified());

	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn size_accounting_follows_writes_and_dooms() {
	let dir = tempdir().unwrap();
	let backend = open(dir.path()).await;

	let before = stat(&backend, "Current size").await;
	let entry = create_with(&backend, "sized", 0, &payload(1, 5_000)).await;
	entry.write_data(1, 0, payload(2, 3_000), true).await.unwrap();
	assert_eq!(stat(&backend, "Current size").await, before + 8_000);

	entry.write_data(0, 0, payload(3, 1_000), true).await.unwrap();
	assert_eq!(stat(&backend, "Current size").await, before + 4_000);

	entry.doom().await.unwrap();
	assert_eq!(stat(&backend, "Current size").await, before);

	// Writes to a doomed entry don't count anymore.
	entry.write_data(2, 0, payload(4, 2_000), true).await.unwrap();
	assert_eq!(stat(&backend, "Current size").await, before);

	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn fresh_entries_reopen_empty() {
	let dir = tempdir().unwrap();
	let backend = open(dir.path()).await;

	backend.create_entry("fresh").await.unwrap().close();

	let entry = backend.open_entry("fresh").await.unwrap();
	assert_eq!(entry.key(), b"fresh");
	for stream in 0..3 {
		assert_eq!(entry.data_size(stream), 0);
		assert!(read_all(&entry, stream).await.is_empty());
	}
	entry.close();
	backend.shutdown().await.unwrap();

	let backend = open(dir.path()).await;
	let entry = backend.open_entry("fresh").await.unwrap();
	assert_eq!(entry.key(), b"fresh");
	assert!((0..3).all(|stream| entry.data_size(stream) == 0));
	backend.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn dooming_twice_counts_once() {
	let dir = tempdir().unwrap();
	let backend = open(dir.path()).await;

	create_with(&backend, "kept", 0, b"kept").await;
	let entry = create_with(&backend, "doomed", 0, b"doomed").await;
	assert_eq!(backend.entry_count(), 2);

	entry.doom().await.unwrap();
	entry.doom().await.unwrap();
	assert_eq!(backend.entry_count(), 1);
	assert_eq!(stat(&backend, "Doom entry").await, 1);

	entry.close();
	assert_eq!(backend.entry_count(), 1);
	assert_eq!(backend.self_check().await.unwrap(), 1);
	assert!(matches!(
		backend.open_entry("doomed").await,
		Err(Error::NotFound)
	));
	assert!(backend.open_entry("kept").await.is_ok());

	backend.shutdown().await.unwrap();
}
