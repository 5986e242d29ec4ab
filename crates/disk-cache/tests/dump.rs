use sd_disk_cache::dump::{copy_entries, dump_to_dir, Manifest, MANIFEST_NAME};

use tempfile::tempdir;
use tracing_test::traced_test;

mod common;

use common::{create_with, open, payload, read_all};

const CHILD_SPAN: u64 = 1 << 20;

#[tokio::test]
#[traced_test]
async fn copy_recreates_every_entry() {
	let src_dir = tempdir().unwrap();
	let dst_dir = tempdir().unwrap();

	let src = open(src_dir.path()).await;
	for n in 0..5 {
		let entry = create_with(&src, &format!("key {n}"), 0, &payload(n, 1000 * (n as usize + 1))).await;
		entry.write_data(1, 0, payload(n + 100, 300), true).await.unwrap();
	}
	let sparse = src.create_entry("sparse").await.unwrap();
	sparse
		.write_sparse_data(CHILD_SPAN - 1024, payload(9, 4096))
		.await
		.unwrap();
	drop(sparse);

	let dst = open(dst_dir.path()).await;
	create_with(&dst, "key 0", 0, b"already there").await;

	assert_eq!(copy_entries(&src, &dst).await.unwrap(), 5);

	for n in 1..5 {
		let entry = dst.open_entry(format!("key {n}")).await.unwrap();
		assert_eq!(read_all(&entry, 0).await, payload(n, 1000 * (n as usize + 1)));
		assert_eq!(read_all(&entry, 1).await, payload(n + 100, 300));
	}

	let untouched = dst.open_entry("key 0").await.unwrap();
	assert_eq!(read_all(&untouched, 0).await, b"already there");

	let sparse = dst.open_entry("sparse").await.unwrap();
	assert_eq!(
		sparse.read_sparse_data(CHILD_SPAN - 1024, 4096).await.unwrap(),
		payload(9, 4096)
	);

	// Five plain entries, the sparse parent and its two children.
	assert_eq!(dst.self_check().await.unwrap(), 8);

	src.shutdown().await.unwrap();
	dst.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn dump_writes_streams_and_manifest() {
	let src_dir = tempdir().unwrap();
	let out_dir = tempdir().unwrap();

	let src = open(src_dir.path()).await;
	create_with(&src, "first", 0, b"first data").await;
	let second = create_with(&src, "second", 2, &payload(2, 5000)).await;
	drop(second);
	let sparse = src.create_entry("sparse").await.unwrap();
	sparse.write_sparse_data(0, payload(3, 2048)).await.unwrap();
	sparse.write_sparse_data(8192, payload(4, 1024)).await.unwrap();
	drop(sparse);

	let manifest = dump_to_dir(&src, out_dir.path()).await.unwrap();
	assert_eq!(manifest.entries.len(), 3);

	let on_disk: Manifest = serde_json::from_slice(
		&tokio::fs::read(out_dir.path().join(MANIFEST_NAME))
			.await
			.unwrap(),
	)
	.unwrap();
	assert_eq!(on_disk, manifest);

	let second = manifest
		.entries
		.iter()
		.find(|entry| entry.key == "second")
		.unwrap();
	assert_eq!(second.stream_sizes, [0, 0, 5000]);
	assert_eq!(
		tokio::fs::read(out_dir.path().join(format!("{}_s2", second.file_prefix)))
			.await
			.unwrap(),
		payload(2, 5000)
	);

	let sparse = manifest
		.entries
		.iter()
		.find(|entry| entry.key == "sparse")
		.unwrap();
	assert_eq!(sparse.sparse_ranges.len(), 2);
	assert_eq!(sparse.sparse_ranges[1].offset, 8192);
	assert_eq!(
		tokio::fs::read(out_dir.path().join(format!("{}_sparse", sparse.file_prefix)))
			.await
			.unwrap(),
		[payload(3, 2048), payload(4, 1024)].concat()
	);

	src.shutdown().await.unwrap();
}
