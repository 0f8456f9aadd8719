// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Linear schema migrations for the embedded store (§6 "meta.db_version").
//!
//! `meta/db_version` (a big-endian `u32`) tracks the schema version last
//! applied. On open, every migrator whose `version` exceeds the current
//! value runs, in ascending order, inside one transaction together with the
//! version bump — a partial migration can never be observed, and a failed
//! one leaves the version untouched. There are no migrators yet: this
//! crate ships a single on-disk format, version 0.

use crate::error::StoreError;
use crate::kvstore::{Db, Update};

const META: &[u8] = b"meta";
const DB_VERSION: &[u8] = b"db_version";

/// One schema change: `run` receives the in-progress transaction so its
/// writes land atomically alongside every other pending migrator and the
/// version bump itself.
pub struct Migration {
	pub version: u32,
	pub run: fn(&Update<'_>) -> Result<(), sled::transaction::UnabortableTransactionError>,
}

/// The schema migrators this crate ships with. Empty at this version.
pub const MIGRATIONS: &[Migration] = &[];

impl Db {
	/// Reads `meta/db_version`, defaulting to 0 if the key (or the whole
	/// store) has never been written.
	pub fn schema_version(&self) -> Result<u32, StoreError> {
		match self.get(&[META], DB_VERSION)? {
			Some(v) if v.len() == 4 => Ok(u32::from_be_bytes([v[0], v[1], v[2], v[3]])),
			_ => Ok(0),
		}
	}

	/// Runs every migrator in `migrations` whose version is newer than the
	/// currently recorded one, in one all-or-nothing transaction, then
	/// records the highest version applied. A no-op if none are pending.
	pub fn run_migrations(&self, migrations: &[Migration]) -> Result<(), StoreError> {
		let current = self.schema_version()?;
		let mut pending: Vec<&Migration> = migrations.iter().filter(|m| m.version > current).collect();
		if pending.is_empty() {
			return Ok(());
		}
		pending.sort_by_key(|m| m.version);
		let target = pending.last().expect("checked non-empty above").version;

		self.update::<(), StoreError>(|tx| {
			for migration in &pending {
				(migration.run)(tx)?;
			}
			tx.put(&[META], DB_VERSION, &target.to_be_bytes())?;
			Ok(())
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn temp_db() -> (tempfile::TempDir, Db) {
		let dir = tempfile::tempdir().unwrap();
		let db = Db::open(dir.path()).unwrap();
		(dir, db)
	}

	#[test]
	fn fresh_store_is_version_zero() {
		let (_dir, db) = temp_db();
		assert_eq!(db.schema_version().unwrap(), 0);
	}

	#[test]
	fn empty_migration_list_is_a_no_op() {
		let (_dir, db) = temp_db();
		db.run_migrations(MIGRATIONS).unwrap();
		assert_eq!(db.schema_version().unwrap(), 0);
	}

	#[test]
	fn pending_migrators_run_once_and_bump_version() {
		let (_dir, db) = temp_db();
		fn seed(tx: &Update<'_>) -> Result<(), sled::transaction::UnabortableTransactionError> {
			tx.put(&[b"open_channels"], b"marker", b"v1")?;
			Ok(())
		}
		let migrations = [Migration { version: 1, run: seed }];

		db.run_migrations(&migrations).unwrap();
		assert_eq!(db.schema_version().unwrap(), 1);
		assert_eq!(db.get(&[b"open_channels"], b"marker").unwrap().unwrap().to_vec(), b"v1");

		// Re-running is a no-op: the migrator does not run twice.
		db.run_migrations(&migrations).unwrap();
		assert_eq!(db.schema_version().unwrap(), 1);
	}
}
