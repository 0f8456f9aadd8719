// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Component A: a transactional, nested-bucket key-value abstraction over
//! an embedded store.
//!
//! `sled` provides the ordering, the crash-safe log, and single-tree
//! transactions; this module adds the "nested named bucket" vocabulary the
//! rest of the crate is written against; see [`keypath`] for how a bucket
//! path and a leaf key are folded into one sled key while keeping the
//! leaf's own byte order intact for cursor iteration.
//!
//! All multi-byte integer keys the rest of this crate builds are
//! big-endian (`to_be_bytes`/`from_be_bytes`), consistently, everywhere —
//! this is the "single process-wide big-endian encoder" the design notes
//! call for; there is no locally-scoped alternative encoding anywhere in
//! this crate.
//!
//! sled's transactions cannot iterate internally (only point get/insert/
//! remove), so any operation that needs to delete an unbounded, unknown set
//! of keys (closing a channel's delta log, sweeping a nursery bucket) first
//! collects the affected keys with a read-only prefix scan, then replays
//! point removes for exactly those keys inside the transaction. Readers are
//! never blocked by this: scans observe a single consistent sled snapshot,
//! matching the "view transactions are consistent snapshots" requirement
//! without needing a snapshot type of their own.

pub mod keypath;

pub use keypath::{bucket_path, leaf_key};

use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::IVec;
use std::path::Path;

use crate::error::StoreError;

/// An opened embedded store. Cheap to clone-by-reference (`Arc` it at the
/// call site); all methods take `&self`.
pub struct Db {
	// Kept so the `sled::Db` (and its background GC thread) outlives `tree`.
	#[allow(dead_code)]
	inner: sled::Db,
	tree: sled::Tree,
}

/// A handle passed into the closure given to [`Db::update`]; the only way
/// to mutate storage.
pub struct Update<'a> {
	tx: &'a TransactionalTree,
}

impl Db {
	/// Opens (creating if absent) the embedded store rooted at `path`, then
	/// runs any pending schema migrations before returning (§6
	/// `meta.db_version`; see [`crate::migrations`]).
	///
	/// sled keeps its files in a directory rather than lnd's single `.db`
	/// file, so "permission 0600" (§6) is approximated by restricting every
	/// file sled creates there to owner-read-write, immediately after open.
	pub fn open(path: &Path) -> Result<Self, StoreError> {
		let inner = sled::Config::new().path(path).open()?;
		let tree = inner.open_tree(b"main")?;
		#[cfg(unix)]
		restrict_permissions(path);
		let db = Self { inner, tree };
		db.run_migrations(crate::migrations::MIGRATIONS)?;
		Ok(db)
	}

	/// Point lookup of `key` inside the bucket named by `segments`. A
	/// missing bucket and a missing key are indistinguishable here by
	/// design (§4.A: "missing-bucket lookups return a distinguished
	/// sentinel, not an error" — the sentinel is simply `None`).
	pub fn get(&self, segments: &[&[u8]], key: &[u8]) -> Result<Option<IVec>, StoreError> {
		Ok(self.tree.get(leaf_key(segments, key))?)
	}

	/// Ordered iteration over every `(leaf_key, value)` pair directly under
	/// `segments`, with the bucket prefix stripped from each returned key.
	pub fn iter_prefix(
		&self, segments: &[&[u8]],
	) -> impl Iterator<Item = Result<(IVec, IVec), StoreError>> {
		let prefix = bucket_path(segments);
		let prefix_len = prefix.len();
		self.tree.scan_prefix(prefix).map(move |r| {
			r.map(|(k, v)| (IVec::from(&k[prefix_len..]), v)).map_err(StoreError::from)
		})
	}

	/// Whether any key currently lives under this bucket path (its own
	/// records, or those of a nested sub-bucket). Since buckets only exist
	/// as shared key prefixes, this is the only notion of "exists."
	pub fn bucket_exists(&self, segments: &[&[u8]]) -> Result<bool, StoreError> {
		let prefix = bucket_path(segments);
		Ok(self.tree.scan_prefix(prefix).next().transpose()?.is_some())
	}

	/// Collects every full on-disk key currently under `segments`. Used to
	/// stage an unbounded-width delete before entering a transaction.
	pub fn collect_prefix_keys(&self, segments: &[&[u8]]) -> Result<Vec<IVec>, StoreError> {
		let prefix = bucket_path(segments);
		self.tree.scan_prefix(prefix).map(|r| r.map(|(k, _)| k).map_err(StoreError::from)).collect()
	}

	/// Runs `f` as a single all-or-nothing transaction over the store.
	/// Failures propagate unchanged and abort the whole transaction (§7).
	pub fn update<T, E>(
		&self, f: impl Fn(&Update<'_>) -> Result<T, ConflictableTransactionError<E>>,
	) -> Result<T, E>
	where
		E: From<sled::Error>,
	{
		self.tree.transaction(move |tx| f(&Update { tx })).map_err(|e| match e {
			TransactionError::Abort(e) => e,
			TransactionError::Storage(e) => E::from(e),
		})
	}

	/// Deletes every key under each of `top_level_buckets` in one
	/// transaction. Absent buckets are silently skipped (§6 "Wipe").
	pub fn wipe(&self, top_level_buckets: &[&[u8]]) -> Result<(), StoreError> {
		let mut all_keys = Vec::new();
		for bucket in top_level_buckets {
			all_keys.extend(self.collect_prefix_keys(&[bucket])?);
		}
		self.update::<(), StoreError>(|tx| {
			for key in &all_keys {
				tx.remove_raw(key)?;
			}
			Ok(())
		})
	}
}

impl<'a> Update<'a> {
	/// Point lookup inside a running transaction, for read-modify-write
	/// updates to an existing record (e.g. patching balances into an
	/// already-stored scalar record).
	pub fn get(
		&self, segments: &[&[u8]], key: &[u8],
	) -> Result<Option<IVec>, sled::transaction::UnabortableTransactionError> {
		self.tx.get(leaf_key(segments, key))
	}

	/// Writes `value` at `key` inside the bucket named by `segments`.
	pub fn put(
		&self, segments: &[&[u8]], key: &[u8], value: &[u8],
	) -> Result<(), sled::transaction::UnabortableTransactionError> {
		self.tx.insert(leaf_key(segments, key), value)?;
		Ok(())
	}

	/// Removes `key` inside the bucket named by `segments`, if present.
	pub fn remove(
		&self, segments: &[&[u8]], key: &[u8],
	) -> Result<(), sled::transaction::UnabortableTransactionError> {
		self.tx.remove(leaf_key(segments, key))?;
		Ok(())
	}

	/// Removes an already-fully-encoded key, e.g. one returned by
	/// [`Db::collect_prefix_keys`].
	pub fn remove_raw(
		&self, full_key: &[u8],
	) -> Result<(), sled::transaction::UnabortableTransactionError> {
		self.tx.remove(full_key)?;
		Ok(())
	}
}

#[cfg(unix)]
fn restrict_permissions(dir: &Path) {
	use std::fs;
	use std::os::unix::fs::PermissionsExt;

	let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
	if let Ok(entries) = fs::read_dir(dir) {
		for entry in entries.flatten() {
			if entry.path().is_file() {
				let _ = fs::set_permissions(entry.path(), fs::Permissions::from_mode(0o600));
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use sled::transaction::ConflictableTransactionError;

	fn temp_db() -> (tempfile::TempDir, Db) {
		let dir = tempfile::tempdir().unwrap();
		let db = Db::open(dir.path()).unwrap();
		(dir, db)
	}

	#[test]
	fn missing_bucket_get_returns_none_not_error() {
		let (_dir, db) = temp_db();
		let v = db.get(&[b"open_channels", b"node"], b"key").unwrap();
		assert!(v.is_none());
	}

	#[test]
	fn put_then_get_round_trips() {
		let (_dir, db) = temp_db();
		db.update::<(), StoreError>(|tx| {
			tx.put(&[b"bucket"], b"k", b"v")?;
			Ok(())
		})
		.unwrap();
		let v = db.get(&[b"bucket"], b"k").unwrap().unwrap();
		assert_eq!(&v[..], b"v");
	}

	#[test]
	fn prefix_scan_is_ordered_and_scoped() {
		let (_dir, db) = temp_db();
		db.update::<(), StoreError>(|tx| {
			tx.put(&[b"a"], &3u32.to_be_bytes(), b"three")?;
			tx.put(&[b"a"], &1u32.to_be_bytes(), b"one")?;
			tx.put(&[b"a"], &2u32.to_be_bytes(), b"two")?;
			tx.put(&[b"b"], &1u32.to_be_bytes(), b"unrelated")?;
			Ok(())
		})
		.unwrap();
		let got: Vec<_> = db.iter_prefix(&[b"a"]).map(|r| r.unwrap().1.to_vec()).collect();
		assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
	}

	#[test]
	fn transaction_is_all_or_nothing() {
		let (_dir, db) = temp_db();
		let result = db.update::<(), StoreError>(|tx| {
			tx.put(&[b"a"], b"k1", b"v1")?;
			Err(ConflictableTransactionError::Abort(StoreError::NoChanDb))
		});
		assert!(result.is_err());
		assert!(db.get(&[b"a"], b"k1").unwrap().is_none());
	}

	#[test]
	fn wipe_ignores_absent_buckets() {
		let (_dir, db) = temp_db();
		db.wipe(&[b"open_channels", b"closed_channels", b"invoices", b"node_info"]).unwrap();
	}
}
