// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Component D: two-stage on-chain output maturation, indexed by both
//! channel and block height.
//!
//! Bucket layout, all rooted under a chain-segmented prefix so several
//! chains can share one physical store:
//! ```text
//! utxn/<chain_hash>/
//!   last_finalized_height                                     u32 BE
//!   channel_index/<chan_outpoint>/<state_prefix><out_outpoint>  serialized output
//!   height_index/<height BE>/<chan_outpoint>/<state_prefix><out_outpoint>  (empty)
//! ```
//!
//! `channel_index` holds the real bytes; `height_index` holds empty
//! pointer entries whose mere presence signals "this output has an action
//! due at this height" — fetching by height means scanning `height_index`
//! and dereferencing each hit back into `channel_index`.

pub mod types;

use std::sync::Arc;

use crate::codec::Outpoint;
use crate::error::{RemoveOutcome, StoreError};
use crate::kvstore::Db;

pub use types::{BabyOutput, KidOutput, NurseryOutput};

const UTXN: &[u8] = b"utxn";
const CHANNEL_INDEX: &[u8] = b"channel_index";
const HEIGHT_INDEX: &[u8] = b"height_index";
const LAST_FINALIZED_HEIGHT: &[u8] = b"last_finalized_height";

const CRIB: &[u8; 4] = b"crib";
const PSCL: &[u8; 4] = b"pscl";
const KNDR: &[u8; 4] = b"kndr";

fn leaf_for(prefix: &[u8; 4], outpoint: &Outpoint) -> Vec<u8> {
	let mut buf = prefix.to_vec();
	buf.extend_from_slice(&outpoint.encode());
	buf
}

/// Splits a `height_index` scan suffix (a length-prefixed channel-outpoint
/// segment followed by the unframed leaf bytes) back into its two parts.
fn split_chan_and_leaf(suffix: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
	if suffix.len() < 2 {
		return None;
	}
	let seg_len = u16::from_be_bytes([suffix[0], suffix[1]]) as usize;
	if suffix.len() < 2 + seg_len {
		return None;
	}
	let chan_point = suffix[2..2 + seg_len].to_vec();
	let leaf = suffix[2 + seg_len..].to_vec();
	Some((chan_point, leaf))
}

pub struct NurseryStore {
	db: Arc<Db>,
	chain_hash: [u8; 32],
}

impl NurseryStore {
	pub fn new(db: Arc<Db>, chain_hash: [u8; 32]) -> Self {
		Self { db, chain_hash }
	}

	fn root<'a>(&'a self) -> Vec<&'a [u8]> {
		vec![UTXN, &self.chain_hash[..]]
	}

	fn channel_bucket(&self, chan_point: &Outpoint) -> Vec<u8> {
		chan_point.encode()
	}

	/// The last block height whose nursery actions are durably committed
	/// beyond reorg risk. Zero if never finalized.
	pub fn last_finalized_height(&self) -> Result<u32, StoreError> {
		let root = self.root();
		match self.db.get(&root, LAST_FINALIZED_HEIGHT)? {
			Some(v) if v.len() == 4 => Ok(u32::from_be_bytes([v[0], v[1], v[2], v[3]])),
			_ => Ok(0),
		}
	}

	/// Records `h` as finalized. Callers must pass `current_best -
	/// reorg_safety_depth`; on restart, replay resumes at `h + 1`.
	pub fn finalize_class(&self, h: u32) -> Result<(), StoreError> {
		let root = self.root();
		self.db.update::<(), StoreError>(|tx| {
			tx.put(&root, LAST_FINALIZED_HEIGHT, &h.to_be_bytes())?;
			Ok(())
		})
	}

	/// Admits a new HTLC output awaiting its CLTV expiry.
	pub fn enter_crib(&self, baby: &BabyOutput) -> Result<(), StoreError> {
		let chan_point = baby.kid.origin_chan_point;
		let chan_key = self.channel_bucket(&chan_point);
		let leaf = leaf_for(CRIB, &baby.kid.outpoint);
		let value = baby.encode();
		let root = self.root();

		self.db.update::<(), StoreError>(|tx| {
			let channel_index = [root.as_slice(), &[CHANNEL_INDEX, chan_key.as_slice()]].concat();
			tx.put(&channel_index, &leaf, &value)?;

			let expiry_bytes = baby.expiry.to_be_bytes();
			let height_index = [
				root.as_slice(),
				&[HEIGHT_INDEX, &expiry_bytes[..], chan_key.as_slice()],
			]
			.concat();
			tx.put(&height_index, &leaf, &[])?;
			Ok(())
		})
	}

	/// Admits a CSV-delayed output whose maturity height isn't known yet.
	pub fn enter_preschool(&self, kid: &KidOutput) -> Result<(), StoreError> {
		let chan_key = self.channel_bucket(&kid.origin_chan_point);
		let leaf = leaf_for(PSCL, &kid.outpoint);
		let value = kid.encode();
		let root = self.root();

		self.db.update::<(), StoreError>(|tx| {
			let channel_index = [root.as_slice(), &[CHANNEL_INDEX, chan_key.as_slice()]].concat();
			tx.put(&channel_index, &leaf, &value)?;
			Ok(())
		})
	}

	/// Moves a baby output past its CLTV expiry into the CSV-delayed
	/// kindergarten class: removes the `crib` entry (and its height-index
	/// pointer at `expiry`) and inserts the `kndr` entry at
	/// `conf_height + blocks_to_maturity`, atomically.
	pub fn crib_to_kinder(&self, baby: &BabyOutput) -> Result<(), StoreError> {
		let chan_key = self.channel_bucket(&baby.kid.origin_chan_point);
		let old_leaf = leaf_for(CRIB, &baby.kid.outpoint);
		let new_leaf = leaf_for(KNDR, &baby.kid.outpoint);
		let new_value = baby.kid.encode();
		let root = self.root();
		let maturity = baby.kid.maturity_height();

		self.db.update::<(), StoreError>(|tx| {
			let channel_index = [root.as_slice(), &[CHANNEL_INDEX, chan_key.as_slice()]].concat();
			tx.remove(&channel_index, &old_leaf)?;
			tx.put(&channel_index, &new_leaf, &new_value)?;

			let expiry_bytes = baby.expiry.to_be_bytes();
			let old_height_index = [
				root.as_slice(),
				&[HEIGHT_INDEX, &expiry_bytes[..], chan_key.as_slice()],
			]
			.concat();
			tx.remove(&old_height_index, &old_leaf)?;

			let maturity_bytes = maturity.to_be_bytes();
			let new_height_index = [
				root.as_slice(),
				&[HEIGHT_INDEX, &maturity_bytes[..], chan_key.as_slice()],
			]
			.concat();
			tx.put(&new_height_index, &new_leaf, &[])?;
			Ok(())
		})
	}

	/// Moves a preschool output into kindergarten once its maturity height
	/// becomes known.
	pub fn preschool_to_kinder(&self, kid: &KidOutput) -> Result<(), StoreError> {
		let chan_key = self.channel_bucket(&kid.origin_chan_point);
		let old_leaf = leaf_for(PSCL, &kid.outpoint);
		let new_leaf = leaf_for(KNDR, &kid.outpoint);
		let value = kid.encode();
		let root = self.root();
		let maturity = kid.maturity_height();

		self.db.update::<(), StoreError>(|tx| {
			let channel_index = [root.as_slice(), &[CHANNEL_INDEX, chan_key.as_slice()]].concat();
			tx.remove(&channel_index, &old_leaf)?;
			tx.put(&channel_index, &new_leaf, &value)?;

			let maturity_bytes = maturity.to_be_bytes();
			let height_index = [
				root.as_slice(),
				&[HEIGHT_INDEX, &maturity_bytes[..], chan_key.as_slice()],
			]
			.concat();
			tx.put(&height_index, &new_leaf, &[])?;
			Ok(())
		})
	}

	/// Sweeps matured kindergarten outputs: removes each from its channel
	/// and height indexes. Returns the origin channel outpoint for every
	/// `kid` whose channel bucket is now completely empty — ready to be
	/// marked closed by the channel store.
	pub fn award_diplomas(&self, kids: &[KidOutput]) -> Result<Vec<Outpoint>, StoreError> {
		let root = self.root();

		self.db.update::<(), StoreError>(|tx| {
			for kid in kids {
				let chan_key = self.channel_bucket(&kid.origin_chan_point);
				let leaf = leaf_for(KNDR, &kid.outpoint);
				let channel_index = [root.as_slice(), &[CHANNEL_INDEX, chan_key.as_slice()]].concat();
				tx.remove(&channel_index, &leaf)?;

				let maturity = kid.maturity_height();
				let maturity_bytes = maturity.to_be_bytes();
				let height_index = [
					root.as_slice(),
					&[HEIGHT_INDEX, &maturity_bytes[..], chan_key.as_slice()],
				]
				.concat();
				tx.remove(&height_index, &leaf)?;
			}
			Ok(())
		})?;

		let mut graduated = Vec::new();
		let mut seen = std::collections::HashSet::new();
		for kid in kids {
			if !seen.insert(kid.origin_chan_point) {
				continue;
			}
			let chan_key = self.channel_bucket(&kid.origin_chan_point);
			let channel_index: Vec<&[u8]> =
				[root.as_slice(), &[CHANNEL_INDEX, chan_key.as_slice()]].concat();
			if !self.db.bucket_exists(&channel_index)? {
				graduated.push(kid.origin_chan_point);
			}
		}
		Ok(graduated)
	}

	/// Lists every [`BabyOutput`] whose CLTV expires at `h`.
	pub fn fetch_cribs(&self, h: u32) -> Result<Vec<BabyOutput>, StoreError> {
		self.fetch_by_height_and_prefix(h, CRIB, BabyOutput::decode)
	}

	/// Lists every [`KidOutput`] maturing at `h`.
	pub fn fetch_kindergartens(&self, h: u32) -> Result<Vec<KidOutput>, StoreError> {
		self.fetch_by_height_and_prefix(h, KNDR, KidOutput::decode)
	}

	fn fetch_by_height_and_prefix<T>(
		&self, h: u32, prefix: &[u8; 4], decode: impl Fn(&[u8]) -> Result<T, crate::codec::CodecError>,
	) -> Result<Vec<T>, StoreError> {
		let root = self.root();
		let h_bytes = h.to_be_bytes();
		let height_index: Vec<&[u8]> = [root.as_slice(), &[HEIGHT_INDEX, &h_bytes[..]]].concat();

		let mut results = Vec::new();
		for entry in self.db.iter_prefix(&height_index) {
			let (suffix, _) = entry?;
			let Some((chan_point, leaf)) = split_chan_and_leaf(&suffix) else { continue };
			if leaf.len() < 4 || &leaf[0..4] != &prefix[..] {
				continue;
			}
			let channel_index: Vec<&[u8]> = [root.as_slice(), &[CHANNEL_INDEX, chan_point.as_slice()]].concat();
			if let Some(value) = self.db.get(&channel_index, &leaf)? {
				results.push(decode(&value)?);
			}
		}
		Ok(results)
	}

	/// Full scan for every preschool output across all channel buckets.
	pub fn fetch_preschools(&self) -> Result<Vec<KidOutput>, StoreError> {
		let root = self.root();
		let channel_index: Vec<&[u8]> = [root.as_slice(), &[CHANNEL_INDEX]].concat();

		let mut results = Vec::new();
		for entry in self.db.iter_prefix(&channel_index) {
			let (suffix, value) = entry?;
			let Some((_, leaf)) = split_chan_and_leaf(&suffix) else { continue };
			if leaf.len() < 4 || &leaf[0..4] != &PSCL[..] {
				continue;
			}
			results.push(KidOutput::decode(&value)?);
		}
		Ok(results)
	}

	/// Decodes every output currently held in a channel's own bucket,
	/// tagged by class, and hands each to `cb`. Entries whose leaf prefix
	/// doesn't match a known class are skipped rather than surfaced as a
	/// raw, untyped blob.
	pub fn for_chan_outputs(
		&self, chan_point: &Outpoint, mut cb: impl FnMut(NurseryOutput),
	) -> Result<(), StoreError> {
		let root = self.root();
		let chan_key = self.channel_bucket(chan_point);
		let channel_index: Vec<&[u8]> = [root.as_slice(), &[CHANNEL_INDEX, chan_key.as_slice()]].concat();
		for entry in self.db.iter_prefix(&channel_index) {
			let (leaf, value) = entry?;
			if leaf.len() < 4 {
				continue;
			}
			let output = match &leaf[0..4] {
				p if p == &CRIB[..] => NurseryOutput::Crib(BabyOutput::decode(&value)?),
				p if p == &PSCL[..] => NurseryOutput::Preschool(KidOutput::decode(&value)?),
				p if p == &KNDR[..] => NurseryOutput::Kindergarten(KidOutput::decode(&value)?),
				_ => continue,
			};
			cb(output);
		}
		Ok(())
	}

	/// Reports whether a channel's bucket is present, empty, or was never
	/// populated — the three-way pruning sentinel named in §7, absorbed by
	/// callers rather than treated as an error.
	pub fn remove_bucket_if_empty(&self, chan_point: &Outpoint) -> Result<RemoveOutcome, StoreError> {
		let root = self.root();
		let chan_key = self.channel_bucket(chan_point);
		let channel_index: Vec<&[u8]> = [root.as_slice(), &[CHANNEL_INDEX, chan_key.as_slice()]].concat();
		if self.db.bucket_exists(&channel_index)? {
			Ok(RemoveOutcome::BucketNotEmpty)
		} else {
			Ok(RemoveOutcome::BucketDoesNotExist)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn temp_nursery() -> (tempfile::TempDir, NurseryStore) {
		let dir = tempfile::tempdir().unwrap();
		let db = Arc::new(Db::open(dir.path()).unwrap());
		(dir, NurseryStore::new(db, [0u8; 32]))
	}

	fn sample_kid(chan: Outpoint, conf_height: u32, blocks_to_maturity: u32) -> KidOutput {
		KidOutput {
			origin_chan_point: chan,
			outpoint: Outpoint { txid: [9u8; 32], index: 3 },
			amount: 10_000,
			conf_height,
			blocks_to_maturity,
		}
	}

	#[test]
	fn cltv_to_csv_transition_scenario_s4() {
		let (_dir, nursery) = temp_nursery();
		let chan = Outpoint { txid: [1u8; 32], index: 0 };
		let baby = BabyOutput { expiry: 100, kid: sample_kid(chan, 120, 10) };

		nursery.enter_crib(&baby).unwrap();
		assert_eq!(nursery.fetch_cribs(100).unwrap(), vec![baby]);

		nursery.crib_to_kinder(&baby).unwrap();
		assert!(nursery.fetch_cribs(100).unwrap().is_empty());
		assert_eq!(nursery.fetch_kindergartens(130).unwrap(), vec![baby.kid]);
	}

	#[test]
	fn for_chan_outputs_tags_each_entry_by_class() {
		let (_dir, nursery) = temp_nursery();
		let chan = Outpoint { txid: [8u8; 32], index: 0 };
		let baby = BabyOutput { expiry: 50, kid: sample_kid(chan, 60, 10) };
		nursery.enter_crib(&baby).unwrap();

		let mut seen = Vec::new();
		nursery.for_chan_outputs(&chan, |output| seen.push(output)).unwrap();

		assert_eq!(seen, vec![NurseryOutput::Crib(baby)]);
	}

	#[test]
	fn nursery_graduation_closes_channel_scenario_s5() {
		let (_dir, nursery) = temp_nursery();
		let chan = Outpoint { txid: [2u8; 32], index: 0 };
		let kid = sample_kid(chan, 200, 20);

		nursery.enter_preschool(&kid).unwrap();
		assert_eq!(nursery.fetch_preschools().unwrap(), vec![kid]);

		nursery.preschool_to_kinder(&kid).unwrap();
		assert!(nursery.fetch_preschools().unwrap().is_empty());

		let graduated = nursery.award_diplomas(&[kid]).unwrap();
		assert_eq!(graduated, vec![kid.origin_chan_point]);
		assert_eq!(
			nursery.remove_bucket_if_empty(&chan).unwrap(),
			RemoveOutcome::BucketDoesNotExist
		);
	}

	#[test]
	fn height_keys_sort_numerically_invariant_7() {
		let (_dir, nursery) = temp_nursery();
		let chan = Outpoint { txid: [3u8; 32], index: 0 };
		for expiry in [300u32, 9, 100] {
			let baby = BabyOutput {
				expiry,
				kid: KidOutput {
					origin_chan_point: chan,
					outpoint: Outpoint { txid: [expiry as u8; 32], index: 0 },
					amount: 1,
					conf_height: expiry + 10,
					blocks_to_maturity: 5,
				},
			};
			nursery.enter_crib(&baby).unwrap();
		}
		assert_eq!(nursery.fetch_cribs(9).unwrap().len(), 1);
		assert_eq!(nursery.fetch_cribs(100).unwrap().len(), 1);
		assert_eq!(nursery.fetch_cribs(300).unwrap().len(), 1);
	}

	#[test]
	fn finalize_class_persists_last_finalized_height() {
		let (_dir, nursery) = temp_nursery();
		assert_eq!(nursery.last_finalized_height().unwrap(), 0);
		nursery.finalize_class(500).unwrap();
		assert_eq!(nursery.last_finalized_height().unwrap(), 500);
	}
}
