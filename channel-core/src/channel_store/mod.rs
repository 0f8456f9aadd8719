// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Component C: durable per-channel commitment storage.
//!
//! Bucket layout (all segments under [`kvstore`]):
//! ```text
//! open_channels/
//!   scalars/<chan_outpoint>                 ChannelScalars (capacity, balances,
//!                                            min_fee, num_updates, sats sent/recv,
//!                                            net fees) — one record, not one key
//!                                            per field, see DESIGN.md
//!   node_index/<remote_node_id>/<chan_outpoint>       (empty — per-node index)
//!   all_index/<chan_outpoint> -> remote_node_id       (global enumeration index)
//!   nodes/<remote_node_id>/<chan_outpoint>/
//!     ckk        CommitKeysRecord
//!     ctk        CommitTxnsRecord
//!     fsk        FundingRecord
//!     esk        elkrem::ElkremState
//!     rev        RevocationRecord
//!     dsk        DeliveryScriptsRecord
//!     channel_log/<update_num BE>                     ChannelDelta
//! closed_channels/<chan_outpoint>
//! ```
//!
//! The source this is modeled on keeps scalars and per-channel fields under
//! one shared node bucket and indexes channels only per-node; `all_index`
//! is added here so `fetch_all_channels` doesn't need to scan every known
//! node. Delivery scripts are deliberately keyed by `<chan_outpoint>`
//! inside the per-channel bucket rather than by a bare, unscoped key — a
//! shared key would let one channel's delivery scripts leak into another's
//! lookup once more than one channel existed.

pub mod elkrem;
pub mod types;

use std::sync::{Arc, RwLock};

use sled::transaction::ConflictableTransactionError;

use crate::codec::{
	ChannelScalars, CommitKeysRecord, CommitTxnsRecord, CompressedPublicKey, DeliveryScriptsRecord,
	FundingRecord, Outpoint, RevocationRecord,
};
pub use crate::codec::ChannelDelta;
use crate::error::StoreError;
use crate::kvstore::Db;

pub use elkrem::ElkremState;
pub use types::{ChannelSnapshot, OpenChannel};

const OPEN_CHANNELS: &[u8] = b"open_channels";
const SCALARS: &[u8] = b"scalars";
const NODE_INDEX: &[u8] = b"node_index";
const ALL_INDEX: &[u8] = b"all_index";
const NODES: &[u8] = b"nodes";
const CHANNEL_LOG: &[u8] = b"channel_log";
const CLOSED_CHANNELS: &[u8] = b"closed_channels";

const COMMIT_KEYS: &[u8] = b"ckk";
const COMMIT_TXNS: &[u8] = b"ctk";
const FUNDING: &[u8] = b"fsk";
const ELKREM: &[u8] = b"esk";
const REVOCATION: &[u8] = b"rev";
const DELIVERY: &[u8] = b"dsk";

fn chan_key(chan_id: &Outpoint) -> Vec<u8> {
	chan_id.encode()
}

fn node_bucket<'a>(node_id: &'a [u8; 32], key: &'a [u8]) -> Vec<&'a [u8]> {
	vec![OPEN_CHANNELS, NODES, &node_id[..], key]
}

fn node_index_bucket(node_id: &[u8; 32]) -> Vec<&[u8]> {
	vec![OPEN_CHANNELS, NODE_INDEX, &node_id[..]]
}

fn get_required(value: Option<sled::IVec>) -> Result<sled::IVec, StoreError> {
	value.ok_or(StoreError::NoChanDb)
}

/// Durable storage for open and closed channels. Cheap to share: clone the
/// `Arc` this wraps, not the store itself.
pub struct ChannelStore {
	db: Arc<Db>,
}

impl ChannelStore {
	pub fn new(db: Arc<Db>) -> Self {
		Self { db }
	}

	/// Creates the channel's index entries and writes every scalar and
	/// node-bucket field in one transaction. Idempotent on the index entry:
	/// calling this again for the same channel just overwrites its fields.
	pub fn full_sync(&self, channel: &OpenChannel) -> Result<(), StoreError> {
		let key = chan_key(&channel.chan_id);
		let node_id = channel.remote_node_id;

		let scalars = ChannelScalars {
			capacity: channel.capacity,
			our_balance: channel.our_balance,
			their_balance: channel.their_balance,
			min_fee_per_kb: channel.min_fee_per_kb,
			num_updates: channel.num_updates,
			total_sats_sent: channel.total_sats_sent,
			total_sats_received: channel.total_sats_received,
			total_net_fees: channel.total_net_fees,
		}
		.encode();

		let commit_keys = CommitKeysRecord {
			our_commit_key: channel.our_commit_key,
			their_commit_key: channel.their_commit_key,
		}
		.encode();

		let commit_txns = CommitTxnsRecord {
			commit_tx: channel.our_commit_tx.clone(),
			commit_sig: channel.our_commit_sig.clone(),
			local_csv_delay: channel.local_csv_delay,
			remote_csv_delay: channel.remote_csv_delay,
		}
		.encode()?;

		let funding = FundingRecord {
			funding_outpoint: channel.funding_outpoint,
			our_multisig_key: channel.our_multisig_key.clone(),
			their_multisig_key: channel.their_multisig_key.clone(),
			funding_redeem_script: channel.funding_redeem_script.clone(),
			creation_unix: channel.creation_time,
		}
		.encode()?;

		let revocation = RevocationRecord {
			their_current_revocation: channel.their_current_revocation,
			their_current_revocation_hash: channel.their_current_revocation_hash,
		}
		.encode();

		let delivery = DeliveryScriptsRecord {
			our_delivery_script: channel.our_delivery_script.clone(),
			their_delivery_script: channel.their_delivery_script.clone(),
		}
		.encode()?;

		let elkrem = channel.elkrem.encode();

		self.db.update::<(), StoreError>(|tx| {
			tx.put(&[OPEN_CHANNELS, SCALARS], &key, &scalars)?;
			tx.put(&node_index_bucket(&node_id), &key, &[])?;
			tx.put(&[OPEN_CHANNELS, ALL_INDEX], &key, &node_id)?;

			let bucket = node_bucket(&node_id, &key);
			tx.put(&bucket, COMMIT_KEYS, &commit_keys)?;
			tx.put(&bucket, COMMIT_TXNS, &commit_txns)?;
			tx.put(&bucket, FUNDING, &funding)?;
			tx.put(&bucket, ELKREM, &elkrem)?;
			tx.put(&bucket, REVOCATION, &revocation)?;
			tx.put(&bucket, DELIVERY, &delivery)?;
			Ok(())
		})
	}

	/// Updates only the counterparty's current revocation point and this
	/// channel's elkrem state.
	pub fn sync_revocation(
		&self, chan_id: &Outpoint, node_id: &[u8; 32], their_current_revocation: CompressedPublicKey,
		their_current_revocation_hash: [u8; 32], elkrem: &ElkremState,
	) -> Result<(), StoreError> {
		let key = chan_key(chan_id);
		let revocation =
			RevocationRecord { their_current_revocation, their_current_revocation_hash }.encode();
		let elkrem_bytes = elkrem.encode();

		self.db.update::<(), StoreError>(|tx| {
			let bucket = node_bucket(node_id, &key);
			tx.put(&bucket, REVOCATION, &revocation)?;
			tx.put(&bucket, ELKREM, &elkrem_bytes)?;
			Ok(())
		})
	}

	/// Advances a channel's commitment state: updates the balance/num_updates
	/// scalars, replaces the live commitment tx/sig pair, and appends
	/// `delta` to the state-transition log at `funding_txid || update_num`.
	/// The log is append-only in spirit; writing the same `update_num`
	/// twice simply overwrites that entry — callers are responsible for
	/// never calling this out of order.
	pub fn record_delta(
		&self, chan_id: &Outpoint, node_id: &[u8; 32], new_commit_tx: &[u8], new_commit_sig: &[u8],
		local_csv_delay: u32, remote_csv_delay: u32, delta: &ChannelDelta,
	) -> Result<(), StoreError> {
		let key = chan_key(chan_id);
		let commit_txns = CommitTxnsRecord {
			commit_tx: new_commit_tx.to_vec(),
			commit_sig: new_commit_sig.to_vec(),
			local_csv_delay,
			remote_csv_delay,
		}
		.encode()
		.map_err(StoreError::from)?;
		let delta_bytes = delta.encode();
		let update_num = delta.update_num;
		let local_balance = delta.local_balance;
		let remote_balance = delta.remote_balance;

		self.db.update::<(), StoreError>(|tx| {
			let existing = tx.get(&[OPEN_CHANNELS, SCALARS], &key)?;
			let existing = existing
				.ok_or(StoreError::NoChanDb)
				.map_err(ConflictableTransactionError::Abort)?;
			let mut scalars = ChannelScalars::decode(&existing)
				.map_err(StoreError::from)
				.map_err(ConflictableTransactionError::Abort)?;
			scalars.our_balance = local_balance;
			scalars.their_balance = remote_balance;
			scalars.num_updates = update_num as u64;
			tx.put(&[OPEN_CHANNELS, SCALARS], &key, &scalars.encode())?;

			let bucket = node_bucket(node_id, &key);
			tx.put(&bucket, COMMIT_TXNS, &commit_txns)?;

			let mut log_bucket = bucket.clone();
			log_bucket.push(CHANNEL_LOG);
			tx.put(&log_bucket, &update_num.to_be_bytes(), &delta_bytes)?;
			Ok(())
		})
	}

	/// Point lookup in a channel's state-transition log.
	pub fn find_previous_state(
		&self, chan_id: &Outpoint, node_id: &[u8; 32], update_num: u32,
	) -> Result<ChannelDelta, StoreError> {
		let key = chan_key(chan_id);
		let mut log_bucket = node_bucket(node_id, &key);
		log_bucket.push(CHANNEL_LOG);

		if !self.db.bucket_exists(&log_bucket)? {
			return Err(StoreError::NoPastDeltas);
		}
		let raw = self
			.db
			.get(&log_bucket, &update_num.to_be_bytes())?
			.ok_or(StoreError::LogEntryNotFound(update_num))?;
		Ok(ChannelDelta::decode(&raw)?)
	}

	/// Atomically removes every scalar and node-bucket field for this
	/// channel and records a closed-channel summary. Fails with
	/// `no-active-channels` if the channel was never indexed.
	pub fn close_channel(&self, chan_id: &Outpoint, node_id: &[u8; 32]) -> Result<(), StoreError> {
		let key = chan_key(chan_id);

		if self.db.get(&node_index_bucket(node_id), &key)?.is_none() {
			return Err(StoreError::NoActiveChannels);
		}

		let bucket = node_bucket(node_id, &key);
		let node_bucket_keys = self.db.collect_prefix_keys(&bucket)?;

		self.db.update::<(), StoreError>(|tx| {
			tx.remove(&[OPEN_CHANNELS, SCALARS], &key)?;
			tx.remove(&node_index_bucket(node_id), &key)?;
			tx.remove(&[OPEN_CHANNELS, ALL_INDEX], &key)?;
			for full_key in &node_bucket_keys {
				tx.remove_raw(full_key)?;
			}
			tx.put(&[CLOSED_CHANNELS], &key, &[])?;
			Ok(())
		})
	}

	/// Enumerates every channel currently open with `node_id`. A node with
	/// no channels yields an empty list, never an error (§7
	/// `no-active-channels` is recoverable for enumeration).
	pub fn fetch_open_channels(&self, node_id: &[u8; 32]) -> Result<Vec<OpenChannel>, StoreError> {
		let mut channels = Vec::new();
		for entry in self.db.iter_prefix(&node_index_bucket(node_id)) {
			let (key, _) = entry?;
			channels.push(self.load_channel(node_id, &key)?);
		}
		Ok(channels)
	}

	/// Enumerates every currently open channel across all counterparties.
	pub fn fetch_all_channels(&self) -> Result<Vec<OpenChannel>, StoreError> {
		let mut channels = Vec::new();
		for entry in self.db.iter_prefix(&[OPEN_CHANNELS, ALL_INDEX]) {
			let (key, node_id_bytes) = entry?;
			let mut node_id = [0u8; 32];
			node_id.copy_from_slice(&node_id_bytes);
			channels.push(self.load_channel(&node_id, &key)?);
		}
		Ok(channels)
	}

	/// Sums capacity across every open channel without decoding the rest of
	/// each channel's fields — the prefix scan over `scalars` the spec
	/// calls out as the reason for keeping scalars in their own bucket.
	pub fn total_capacity(&self) -> Result<u64, StoreError> {
		let mut total = 0u64;
		for entry in self.db.iter_prefix(&[OPEN_CHANNELS, SCALARS]) {
			let (_, raw) = entry?;
			total += ChannelScalars::decode(&raw)?.capacity;
		}
		Ok(total)
	}

	fn load_channel(&self, node_id: &[u8; 32], key: &[u8]) -> Result<OpenChannel, StoreError> {
		let chan_id = Outpoint::decode(key)?;
		let bucket = node_bucket(node_id, key);

		let scalars_raw = get_required(self.db.get(&[OPEN_CHANNELS, SCALARS], key)?)?;
		let scalars = ChannelScalars::decode(&scalars_raw)?;

		let commit_keys_raw = get_required(self.db.get(&bucket, COMMIT_KEYS)?)?;
		let commit_keys = CommitKeysRecord::decode(&commit_keys_raw)?;

		let commit_txns_raw = get_required(self.db.get(&bucket, COMMIT_TXNS)?)?;
		let commit_txns = CommitTxnsRecord::decode(&commit_txns_raw)?;

		let funding_raw = get_required(self.db.get(&bucket, FUNDING)?)?;
		let funding = FundingRecord::decode(&funding_raw)?;

		let elkrem_raw = get_required(self.db.get(&bucket, ELKREM)?)?;
		let elkrem = ElkremState::decode(&elkrem_raw)?;

		let revocation_raw = get_required(self.db.get(&bucket, REVOCATION)?)?;
		let revocation = RevocationRecord::decode(&revocation_raw)?;

		let delivery_raw = get_required(self.db.get(&bucket, DELIVERY)?)?;
		let delivery = DeliveryScriptsRecord::decode(&delivery_raw)?;

		Ok(OpenChannel {
			remote_node_id: *node_id,
			chan_id,
			capacity: scalars.capacity,
			our_balance: scalars.our_balance,
			their_balance: scalars.their_balance,
			min_fee_per_kb: scalars.min_fee_per_kb,
			our_commit_key: commit_keys.our_commit_key,
			their_commit_key: commit_keys.their_commit_key,
			our_commit_tx: commit_txns.commit_tx,
			our_commit_sig: commit_txns.commit_sig,
			local_csv_delay: commit_txns.local_csv_delay,
			remote_csv_delay: commit_txns.remote_csv_delay,
			funding_outpoint: funding.funding_outpoint,
			our_multisig_key: funding.our_multisig_key,
			their_multisig_key: funding.their_multisig_key,
			funding_redeem_script: funding.funding_redeem_script,
			their_current_revocation: revocation.their_current_revocation,
			their_current_revocation_hash: revocation.their_current_revocation_hash,
			elkrem,
			our_delivery_script: delivery.our_delivery_script,
			their_delivery_script: delivery.their_delivery_script,
			num_updates: scalars.num_updates,
			total_sats_sent: scalars.total_sats_sent,
			total_sats_received: scalars.total_sats_received,
			total_net_fees: scalars.total_net_fees,
			creation_time: funding.creation_unix,
		})
	}
}

/// A live channel's capability handle: a store reference plus this
/// channel's identity, never a back-reference cyclic pointer (§9). Holds
/// the in-memory mirror of the channel's live scalars, updated only after
/// the matching KV transaction has committed successfully.
pub struct ChannelHandle {
	store: Arc<ChannelStore>,
	chan_id: Outpoint,
	node_id: [u8; 32],
	mirror: RwLock<ChannelSnapshot>,
}

impl ChannelHandle {
	pub fn new(
		store: Arc<ChannelStore>, chan_id: Outpoint, node_id: [u8; 32], initial: ChannelSnapshot,
	) -> Self {
		Self { store, chan_id, node_id, mirror: RwLock::new(initial) }
	}

	pub fn chan_id(&self) -> Outpoint {
		self.chan_id
	}

	/// An immutable copy of the channel's live scalars. Never touches the
	/// database.
	pub fn snapshot(&self) -> ChannelSnapshot {
		*self.mirror.read().expect("channel mirror lock poisoned")
	}

	pub fn record_delta(
		&self, new_commit_tx: &[u8], new_commit_sig: &[u8], local_csv_delay: u32,
		remote_csv_delay: u32, delta: &ChannelDelta,
	) -> Result<(), StoreError> {
		self.store.record_delta(
			&self.chan_id,
			&self.node_id,
			new_commit_tx,
			new_commit_sig,
			local_csv_delay,
			remote_csv_delay,
			delta,
		)?;
		let mut mirror = self.mirror.write().expect("channel mirror lock poisoned");
		mirror.our_balance = delta.local_balance;
		mirror.their_balance = delta.remote_balance;
		mirror.num_updates = delta.update_num as u64;
		Ok(())
	}

	pub fn sync_revocation(
		&self, their_current_revocation: CompressedPublicKey, their_current_revocation_hash: [u8; 32],
		elkrem: &ElkremState,
	) -> Result<(), StoreError> {
		self.store.sync_revocation(
			&self.chan_id,
			&self.node_id,
			their_current_revocation,
			their_current_revocation_hash,
			elkrem,
		)
	}

	pub fn close(&self) -> Result<(), StoreError> {
		self.store.close_channel(&self.chan_id, &self.node_id)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::codec::Htlc;

	fn temp_store() -> (tempfile::TempDir, ChannelStore) {
		let dir = tempfile::tempdir().unwrap();
		let db = Arc::new(Db::open(dir.path()).unwrap());
		(dir, ChannelStore::new(db))
	}

	fn sample_channel(node_id: [u8; 32], chan_id: Outpoint) -> OpenChannel {
		OpenChannel {
			remote_node_id: node_id,
			chan_id,
			capacity: 1000,
			our_balance: 500,
			their_balance: 500,
			min_fee_per_kb: 1,
			our_commit_key: CompressedPublicKey([1u8; 33]),
			their_commit_key: CompressedPublicKey([2u8; 33]),
			our_commit_tx: vec![0xaa, 0xbb],
			our_commit_sig: vec![0x01, 0x02],
			local_csv_delay: 144,
			remote_csv_delay: 144,
			funding_outpoint: chan_id,
			our_multisig_key: vec![3u8; 33],
			their_multisig_key: vec![4u8; 33],
			funding_redeem_script: vec![0x52, 0x52, 0xae],
			their_current_revocation: CompressedPublicKey([5u8; 33]),
			their_current_revocation_hash: [6u8; 32],
			elkrem: ElkremState::new([7u8; 32]),
			our_delivery_script: vec![0x00, 0x14],
			their_delivery_script: vec![0x00, 0x14],
			num_updates: 0,
			total_sats_sent: 0,
			total_sats_received: 0,
			total_net_fees: 0,
			creation_time: 1_700_000_000,
		}
	}

	#[test]
	fn round_trip_channel_scenario_s1() {
		let (_dir, store) = temp_store();
		let node_id = [9u8; 32];
		let chan_id = Outpoint { txid: [1u8; 32], index: 0 };
		let channel = sample_channel(node_id, chan_id);
		store.full_sync(&channel).unwrap();

		let fetched = store.fetch_open_channels(&node_id).unwrap();
		assert_eq!(fetched.len(), 1);
		assert_eq!(fetched[0].capacity, 1000);
		assert_eq!(fetched[0].our_balance, 500);
		assert_eq!(fetched[0].their_balance, 500);
	}

	#[test]
	fn total_capacity_sums_without_a_second_channel_closing() {
		let (_dir, store) = temp_store();
		let node_id = [9u8; 32];
		store.full_sync(&sample_channel(node_id, Outpoint { txid: [10u8; 32], index: 0 })).unwrap();
		store.full_sync(&sample_channel(node_id, Outpoint { txid: [11u8; 32], index: 0 })).unwrap();
		assert_eq!(store.total_capacity().unwrap(), 2000);
	}

	#[test]
	fn delta_log_scenario_s2() {
		let (_dir, store) = temp_store();
		let node_id = [9u8; 32];
		let chan_id = Outpoint { txid: [2u8; 32], index: 0 };
		store.full_sync(&sample_channel(node_id, chan_id)).unwrap();

		for (update_num, (local, remote)) in [(1u32, (400u64, 600u64)), (2, (300, 700)), (3, (200, 800))] {
			let delta = ChannelDelta {
				local_balance: local,
				remote_balance: remote,
				update_num,
				htlcs: vec![Htlc {
					incoming: false,
					amt: 10,
					rhash: [update_num as u8; 32],
					refund_timeout: 10,
					revocation_timeout: 1,
				}],
			};
			store
				.record_delta(&chan_id, &node_id, &[0xaa], &[0x01], 144, 144, &delta)
				.unwrap();
		}

		let second = store.find_previous_state(&chan_id, &node_id, 2).unwrap();
		assert_eq!(second.local_balance, 300);
		assert_eq!(second.remote_balance, 700);

		let channels = store.fetch_open_channels(&node_id).unwrap();
		assert_eq!(channels[0].num_updates, 3);
		assert_eq!(channels[0].our_balance, 200);
	}

	#[test]
	fn missing_log_entry_and_bucket_are_distinguished() {
		let (_dir, store) = temp_store();
		let node_id = [9u8; 32];
		let chan_id = Outpoint { txid: [3u8; 32], index: 0 };
		store.full_sync(&sample_channel(node_id, chan_id)).unwrap();

		assert!(matches!(
			store.find_previous_state(&chan_id, &node_id, 1),
			Err(StoreError::NoPastDeltas)
		));

		let delta =
			ChannelDelta { local_balance: 1, remote_balance: 2, update_num: 1, htlcs: vec![] };
		store.record_delta(&chan_id, &node_id, &[0xaa], &[0x01], 144, 144, &delta).unwrap();

		assert!(matches!(
			store.find_previous_state(&chan_id, &node_id, 99),
			Err(StoreError::LogEntryNotFound(99))
		));
	}

	#[test]
	fn close_channel_scenario_s3() {
		let (_dir, store) = temp_store();
		let node_id = [9u8; 32];
		let chan_id = Outpoint { txid: [4u8; 32], index: 0 };
		store.full_sync(&sample_channel(node_id, chan_id)).unwrap();

		store.close_channel(&chan_id, &node_id).unwrap();

		assert!(store.fetch_all_channels().unwrap().is_empty());
		assert!(store.fetch_open_channels(&node_id).unwrap().is_empty());
		let key = chan_key(&chan_id);
		assert!(store.db.get(&[CLOSED_CHANNELS], &key).unwrap().is_some());
		assert!(store.db.get(&[OPEN_CHANNELS, SCALARS], &key).unwrap().is_none());
		let bucket = node_bucket(&node_id, &key);
		assert!(!store.db.bucket_exists(&bucket).unwrap());
	}

	#[test]
	fn closing_unknown_channel_fails_with_no_active_channels() {
		let (_dir, store) = temp_store();
		let node_id = [9u8; 32];
		let chan_id = Outpoint { txid: [5u8; 32], index: 0 };
		assert!(matches!(
			store.close_channel(&chan_id, &node_id),
			Err(StoreError::NoActiveChannels)
		));
	}

	#[test]
	fn channel_handle_mirror_updates_only_after_commit() {
		let (_dir, store) = temp_store();
		let store = Arc::new(store);
		let node_id = [9u8; 32];
		let chan_id = Outpoint { txid: [6u8; 32], index: 0 };
		store.full_sync(&sample_channel(node_id, chan_id)).unwrap();

		let handle = ChannelHandle::new(
			store.clone(),
			chan_id,
			node_id,
			ChannelSnapshot {
				capacity: 1000,
				our_balance: 500,
				their_balance: 500,
				min_fee_per_kb: 1,
				num_updates: 0,
				total_sats_sent: 0,
				total_sats_received: 0,
				total_net_fees: 0,
			},
		);

		let delta =
			ChannelDelta { local_balance: 100, remote_balance: 900, update_num: 1, htlcs: vec![] };
		handle.record_delta(&[0xaa], &[0x01], 144, 144, &delta).unwrap();

		let snap = handle.snapshot();
		assert_eq!(snap.our_balance, 100);
		assert_eq!(snap.num_updates, 1);
	}
}
