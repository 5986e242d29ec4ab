/// Hash used to pick a bucket for a key. Only the low bits are used to index
/// the table, but the whole value is stored in the record to filter chains
/// before comparing full keys.
#[must_use]
pub fn key_hash(key: &[u8]) -> u32 {
	truncate(blake3::hash(key).as_bytes())
}

/// Integrity check stored next to fixed-size records, so torn or stale writes
/// are caught when the record is loaded.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u32 {
	// Zero marks "not computed" on disk, never produce it.
	truncate(blake3::hash(bytes).as_bytes()).max(1)
}

fn truncate(hash: &[u8; 32]) -> u32 {
	u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]])
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stable_and_discriminating() {
		assert_eq!(key_hash(b"the first key"), key_hash(b"the first key"));
		assert_ne!(key_hash(b"the first key"), key_hash(b"the second key"));
		assert_ne!(checksum(&[]), 0);
	}
}
