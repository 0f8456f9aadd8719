// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Component B: canonical on-disk encodings for outpoints, public keys,
//! HTLCs, and the higher-level records built from them.
//!
//! Every multi-byte integer is big-endian, matching [`crate::kvstore`]'s
//! key encoding — there is exactly one byte order used anywhere in this
//! crate. Variable-length fields (signatures, scripts, transactions) are
//! framed with an unsigned LEB128 length prefix; the wire spec leaves the
//! varint scheme unstated, so LEB128 was chosen for being the simplest
//! self-delimiting encoding that never needs a byte-order decision (see
//! DESIGN.md).

use std::convert::TryInto;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
	#[error("unexpected end of input, needed {needed} more byte(s)")]
	UnexpectedEof { needed: usize },
	#[error("length {actual} exceeds maximum {max}")]
	TooLong { actual: usize, max: usize },
	#[error("{0} trailing byte(s) after decoding a fixed-size record")]
	TrailingBytes(usize),
}

/// A forward-only cursor over an encode/decode buffer.
struct Reader<'a> {
	buf: &'a [u8],
	pos: usize,
}

impl<'a> Reader<'a> {
	fn new(buf: &'a [u8]) -> Self {
		Self { buf, pos: 0 }
	}

	fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
		if self.buf.len() - self.pos < n {
			return Err(CodecError::UnexpectedEof { needed: n - (self.buf.len() - self.pos) });
		}
		let slice = &self.buf[self.pos..self.pos + n];
		self.pos += n;
		Ok(slice)
	}

	fn u8(&mut self) -> Result<u8, CodecError> {
		Ok(self.take(1)?[0])
	}

	fn u32_be(&mut self) -> Result<u32, CodecError> {
		Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
	}

	fn u64_be(&mut self) -> Result<u64, CodecError> {
		Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
	}

	fn array32(&mut self) -> Result<[u8; 32], CodecError> {
		Ok(self.take(32)?.try_into().unwrap())
	}

	fn array33(&mut self) -> Result<[u8; 33], CodecError> {
		Ok(self.take(33)?.try_into().unwrap())
	}

	/// Unsigned LEB128.
	fn varint(&mut self) -> Result<u64, CodecError> {
		let mut value: u64 = 0;
		let mut shift = 0;
		loop {
			let byte = self.u8()?;
			value |= u64::from(byte & 0x7f) << shift;
			if byte & 0x80 == 0 {
				return Ok(value);
			}
			shift += 7;
		}
	}

	fn varbytes(&mut self, max: usize) -> Result<Vec<u8>, CodecError> {
		let len = self.varint()? as usize;
		if len > max {
			return Err(CodecError::TooLong { actual: len, max });
		}
		Ok(self.take(len)?.to_vec())
	}

	fn finish(self) -> Result<(), CodecError> {
		let remaining = self.buf.len() - self.pos;
		if remaining != 0 {
			return Err(CodecError::TrailingBytes(remaining));
		}
		Ok(())
	}
}

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
	loop {
		let byte = (value & 0x7f) as u8;
		value >>= 7;
		if value == 0 {
			buf.push(byte);
			break;
		}
		buf.push(byte | 0x80);
	}
}

fn write_varbytes(buf: &mut Vec<u8>, max: usize, bytes: &[u8]) -> Result<(), CodecError> {
	if bytes.len() > max {
		return Err(CodecError::TooLong { actual: bytes.len(), max });
	}
	write_varint(buf, bytes.len() as u64);
	buf.extend_from_slice(bytes);
	Ok(())
}

/// 32-byte transaction hash + 32-bit output index; the canonical channel
/// identifier and output reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Outpoint {
	pub txid: [u8; 32],
	pub index: u32,
}

impl Outpoint {
	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(36);
		write_varbytes(&mut buf, 32, &self.txid).expect("txid is exactly 32 bytes");
		buf.extend_from_slice(&self.index.to_be_bytes());
		buf
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
		let mut r = Reader::new(bytes);
		let txid_vec = r.varbytes(32)?;
		if txid_vec.len() != 32 {
			return Err(CodecError::UnexpectedEof { needed: 32 - txid_vec.len() });
		}
		let index = r.u32_be()?;
		r.finish()?;
		let mut txid = [0u8; 32];
		txid.copy_from_slice(&txid_vec);
		Ok(Self { txid, index })
	}
}

/// 33-byte compressed SEC1 public key, used wherever the spec calls for a
/// fixed-width key (commitment and revocation points).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedPublicKey(pub [u8; 33]);

impl CompressedPublicKey {
	pub fn encode(&self) -> [u8; 33] {
		self.0
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
		let mut r = Reader::new(bytes);
		let key = r.array33()?;
		r.finish()?;
		Ok(Self(key))
	}
}

/// A hash-time-locked contract, fixed at 49 bytes on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Htlc {
	pub incoming: bool,
	pub amt: u64,
	pub rhash: [u8; 32],
	pub refund_timeout: u32,
	pub revocation_timeout: u32,
}

pub const HTLC_ENCODED_LEN: usize = 1 + 8 + 32 + 4 + 4;

impl Htlc {
	pub fn encode(&self) -> [u8; HTLC_ENCODED_LEN] {
		let mut buf = [0u8; HTLC_ENCODED_LEN];
		buf[0] = self.incoming as u8;
		buf[1..9].copy_from_slice(&self.amt.to_be_bytes());
		buf[9..41].copy_from_slice(&self.rhash);
		buf[41..45].copy_from_slice(&self.refund_timeout.to_be_bytes());
		buf[45..49].copy_from_slice(&self.revocation_timeout.to_be_bytes());
		buf
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
		let mut r = Reader::new(bytes);
		let incoming = r.u8()? != 0;
		let amt = r.u64_be()?;
		let rhash = r.array32()?;
		let refund_timeout = r.u32_be()?;
		let revocation_timeout = r.u32_be()?;
		r.finish()?;
		Ok(Self { incoming, amt, rhash, refund_timeout, revocation_timeout })
	}
}

/// A snapshot of channel state at a commitment point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDelta {
	pub local_balance: u64,
	pub remote_balance: u64,
	pub update_num: u32,
	pub htlcs: Vec<Htlc>,
}

impl ChannelDelta {
	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(20 + self.htlcs.len() * HTLC_ENCODED_LEN);
		buf.extend_from_slice(&self.local_balance.to_be_bytes());
		buf.extend_from_slice(&self.remote_balance.to_be_bytes());
		buf.extend_from_slice(&self.update_num.to_be_bytes());
		write_varint(&mut buf, self.htlcs.len() as u64);
		for htlc in &self.htlcs {
			buf.extend_from_slice(&htlc.encode());
		}
		buf
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
		let mut r = Reader::new(bytes);
		let local_balance = r.u64_be()?;
		let remote_balance = r.u64_be()?;
		let update_num = r.u32_be()?;
		let num_htlcs = r.varint()?;
		let mut htlcs = Vec::with_capacity(num_htlcs as usize);
		for _ in 0..num_htlcs {
			let raw = r.take(HTLC_ENCODED_LEN)?;
			htlcs.push(Htlc::decode(raw)?);
		}
		r.finish()?;
		Ok(Self { local_balance, remote_balance, update_num, htlcs })
	}
}

/// The live commitment transaction, the counterparty's signature over it,
/// and the two relative-timelock delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitTxnsRecord {
	pub commit_tx: Vec<u8>,
	pub commit_sig: Vec<u8>,
	pub local_csv_delay: u32,
	pub remote_csv_delay: u32,
}

const MAX_COMMIT_SIG_LEN: usize = 80;
const MAX_COMMIT_TX_LEN: usize = 1 << 20;

impl CommitTxnsRecord {
	pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
		let mut buf = Vec::new();
		write_varbytes(&mut buf, MAX_COMMIT_TX_LEN, &self.commit_tx)?;
		write_varbytes(&mut buf, MAX_COMMIT_SIG_LEN, &self.commit_sig)?;
		buf.extend_from_slice(&self.local_csv_delay.to_be_bytes());
		buf.extend_from_slice(&self.remote_csv_delay.to_be_bytes());
		Ok(buf)
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
		let mut r = Reader::new(bytes);
		let commit_tx = r.varbytes(MAX_COMMIT_TX_LEN)?;
		let commit_sig = r.varbytes(MAX_COMMIT_SIG_LEN)?;
		let local_csv_delay = r.u32_be()?;
		let remote_csv_delay = r.u32_be()?;
		r.finish()?;
		Ok(Self { commit_tx, commit_sig, local_csv_delay, remote_csv_delay })
	}
}

/// The two fixed-width commitment points used by a channel. Not listed
/// among the named encodings in §4.B, but required by the `ckk` field the
/// bucket layout in §4.C names — 33-byte compressed keys, so no varint
/// framing is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitKeysRecord {
	pub our_commit_key: CompressedPublicKey,
	pub their_commit_key: CompressedPublicKey,
}

impl CommitKeysRecord {
	pub fn encode(&self) -> [u8; 66] {
		let mut buf = [0u8; 66];
		buf[..33].copy_from_slice(&self.our_commit_key.0);
		buf[33..].copy_from_slice(&self.their_commit_key.0);
		buf
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
		let mut r = Reader::new(bytes);
		let our_commit_key = CompressedPublicKey(r.array33()?);
		let their_commit_key = CompressedPublicKey(r.array33()?);
		r.finish()?;
		Ok(Self { our_commit_key, their_commit_key })
	}
}

/// The counterparty's current revocation point plus its hash, stored
/// alongside the elkrem record under the `esk` field family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevocationRecord {
	pub their_current_revocation: CompressedPublicKey,
	pub their_current_revocation_hash: [u8; 32],
}

impl RevocationRecord {
	pub fn encode(&self) -> [u8; 65] {
		let mut buf = [0u8; 65];
		buf[..33].copy_from_slice(&self.their_current_revocation.0);
		buf[33..].copy_from_slice(&self.their_current_revocation_hash);
		buf
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
		let mut r = Reader::new(bytes);
		let their_current_revocation = CompressedPublicKey(r.array33()?);
		let their_current_revocation_hash = r.array32()?;
		r.finish()?;
		Ok(Self { their_current_revocation, their_current_revocation_hash })
	}
}

const MAX_DELIVERY_SCRIPT_LEN: usize = 520;

/// The final-settlement output scripts for both parties (the `dsk` field).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryScriptsRecord {
	pub our_delivery_script: Vec<u8>,
	pub their_delivery_script: Vec<u8>,
}

impl DeliveryScriptsRecord {
	pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
		let mut buf = Vec::new();
		write_varbytes(&mut buf, MAX_DELIVERY_SCRIPT_LEN, &self.our_delivery_script)?;
		write_varbytes(&mut buf, MAX_DELIVERY_SCRIPT_LEN, &self.their_delivery_script)?;
		Ok(buf)
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
		let mut r = Reader::new(bytes);
		let our_delivery_script = r.varbytes(MAX_DELIVERY_SCRIPT_LEN)?;
		let their_delivery_script = r.varbytes(MAX_DELIVERY_SCRIPT_LEN)?;
		r.finish()?;
		Ok(Self { our_delivery_script, their_delivery_script })
	}
}

/// The frequently-updated scalar fields kept at the top level of the
/// channel store so a balance update never re-serializes the rest of the
/// channel (§4.C "write-amplification control"). Fixed-width: eight
/// big-endian `u64`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelScalars {
	pub capacity: u64,
	pub our_balance: u64,
	pub their_balance: u64,
	pub min_fee_per_kb: u64,
	pub num_updates: u64,
	pub total_sats_sent: u64,
	pub total_sats_received: u64,
	pub total_net_fees: u64,
}

pub const CHANNEL_SCALARS_LEN: usize = 8 * 8;

impl ChannelScalars {
	pub fn encode(&self) -> [u8; CHANNEL_SCALARS_LEN] {
		let mut buf = [0u8; CHANNEL_SCALARS_LEN];
		buf[0..8].copy_from_slice(&self.capacity.to_be_bytes());
		buf[8..16].copy_from_slice(&self.our_balance.to_be_bytes());
		buf[16..24].copy_from_slice(&self.their_balance.to_be_bytes());
		buf[24..32].copy_from_slice(&self.min_fee_per_kb.to_be_bytes());
		buf[32..40].copy_from_slice(&self.num_updates.to_be_bytes());
		buf[40..48].copy_from_slice(&self.total_sats_sent.to_be_bytes());
		buf[48..56].copy_from_slice(&self.total_sats_received.to_be_bytes());
		buf[56..64].copy_from_slice(&self.total_net_fees.to_be_bytes());
		buf
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
		let mut r = Reader::new(bytes);
		let capacity = r.u64_be()?;
		let our_balance = r.u64_be()?;
		let their_balance = r.u64_be()?;
		let min_fee_per_kb = r.u64_be()?;
		let num_updates = r.u64_be()?;
		let total_sats_sent = r.u64_be()?;
		let total_sats_received = r.u64_be()?;
		let total_net_fees = r.u64_be()?;
		r.finish()?;
		Ok(Self {
			capacity,
			our_balance,
			their_balance,
			min_fee_per_kb,
			num_updates,
			total_sats_sent,
			total_sats_received,
			total_net_fees,
		})
	}
}

/// Funding outpoint plus the multisig keys and redeem script that spend it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingRecord {
	pub funding_outpoint: Outpoint,
	pub our_multisig_key: Vec<u8>,
	pub their_multisig_key: Vec<u8>,
	pub funding_redeem_script: Vec<u8>,
	pub creation_unix: u64,
}

const MAX_MULTISIG_KEY_LEN: usize = 33;
const MAX_REDEEM_SCRIPT_LEN: usize = 520;

impl FundingRecord {
	pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
		let mut buf = self.funding_outpoint.encode();
		write_varbytes(&mut buf, MAX_MULTISIG_KEY_LEN, &self.our_multisig_key)?;
		write_varbytes(&mut buf, MAX_MULTISIG_KEY_LEN, &self.their_multisig_key)?;
		write_varbytes(&mut buf, MAX_REDEEM_SCRIPT_LEN, &self.funding_redeem_script)?;
		buf.extend_from_slice(&self.creation_unix.to_be_bytes());
		Ok(buf)
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
		// The outpoint is itself a varbyte(32)-prefixed hash followed by a
		// fixed 4-byte index; decode it manually here since its length
		// isn't known up front without re-parsing with a shared cursor.
		let mut r = Reader::new(bytes);
		let txid_vec = r.varbytes(32)?;
		if txid_vec.len() != 32 {
			return Err(CodecError::UnexpectedEof { needed: 32 - txid_vec.len() });
		}
		let mut txid = [0u8; 32];
		txid.copy_from_slice(&txid_vec);
		let index = r.u32_be()?;
		let our_multisig_key = r.varbytes(MAX_MULTISIG_KEY_LEN)?;
		let their_multisig_key = r.varbytes(MAX_MULTISIG_KEY_LEN)?;
		let funding_redeem_script = r.varbytes(MAX_REDEEM_SCRIPT_LEN)?;
		let creation_unix = r.u64_be()?;
		r.finish()?;
		Ok(Self {
			funding_outpoint: Outpoint { txid, index },
			our_multisig_key,
			their_multisig_key,
			funding_redeem_script,
			creation_unix,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn outpoint_round_trips() {
		let op = Outpoint { txid: [7u8; 32], index: 42 };
		assert_eq!(Outpoint::decode(&op.encode()).unwrap(), op);
	}

	#[test]
	fn htlc_codec_is_fixed_width_bijection() {
		let h = Htlc {
			incoming: true,
			amt: 123_456,
			rhash: [9u8; 32],
			refund_timeout: 700_000,
			revocation_timeout: 144,
		};
		let encoded = h.encode();
		assert_eq!(encoded.len(), HTLC_ENCODED_LEN);
		assert_eq!(Htlc::decode(&encoded).unwrap(), h);
	}

	#[test]
	fn channel_delta_round_trips_with_htlcs() {
		let delta = ChannelDelta {
			local_balance: 400_000,
			remote_balance: 600_000,
			update_num: 7,
			htlcs: vec![
				Htlc {
					incoming: false,
					amt: 1000,
					rhash: [1u8; 32],
					refund_timeout: 500,
					revocation_timeout: 10,
				},
				Htlc {
					incoming: true,
					amt: 2000,
					rhash: [2u8; 32],
					refund_timeout: 600,
					revocation_timeout: 20,
				},
			],
		};
		let encoded = delta.encode();
		assert_eq!(ChannelDelta::decode(&encoded).unwrap(), delta);
	}

	#[test]
	fn channel_delta_with_no_htlcs_round_trips() {
		let delta =
			ChannelDelta { local_balance: 1, remote_balance: 2, update_num: 0, htlcs: vec![] };
		assert_eq!(ChannelDelta::decode(&delta.encode()).unwrap(), delta);
	}

	#[test]
	fn commit_txns_record_round_trips() {
		let rec = CommitTxnsRecord {
			commit_tx: vec![0xde, 0xad, 0xbe, 0xef],
			commit_sig: vec![1, 2, 3],
			local_csv_delay: 144,
			remote_csv_delay: 288,
		};
		assert_eq!(CommitTxnsRecord::decode(&rec.encode().unwrap()).unwrap(), rec);
	}

	#[test]
	fn commit_sig_over_max_length_is_rejected() {
		let rec = CommitTxnsRecord {
			commit_tx: vec![],
			commit_sig: vec![0u8; MAX_COMMIT_SIG_LEN + 1],
			local_csv_delay: 0,
			remote_csv_delay: 0,
		};
		assert!(matches!(rec.encode(), Err(CodecError::TooLong { .. })));
	}

	#[test]
	fn commit_keys_record_round_trips() {
		let rec = CommitKeysRecord {
			our_commit_key: CompressedPublicKey([4u8; 33]),
			their_commit_key: CompressedPublicKey([5u8; 33]),
		};
		let encoded = rec.encode();
		assert_eq!(encoded.len(), 66);
		assert_eq!(CommitKeysRecord::decode(&encoded).unwrap(), rec);
	}

	#[test]
	fn delivery_scripts_record_round_trips() {
		let rec = DeliveryScriptsRecord {
			our_delivery_script: vec![0x00, 0x14],
			their_delivery_script: vec![0x00, 0x20],
		};
		assert_eq!(DeliveryScriptsRecord::decode(&rec.encode().unwrap()).unwrap(), rec);
	}

	#[test]
	fn revocation_record_round_trips() {
		let rec = RevocationRecord {
			their_current_revocation: CompressedPublicKey([6u8; 33]),
			their_current_revocation_hash: [7u8; 32],
		};
		let encoded = rec.encode();
		assert_eq!(encoded.len(), 65);
		assert_eq!(RevocationRecord::decode(&encoded).unwrap(), rec);
	}

	#[test]
	fn channel_scalars_round_trips() {
		let rec = ChannelScalars {
			capacity: 1_000_000,
			our_balance: 400_000,
			their_balance: 600_000,
			min_fee_per_kb: 1_000,
			num_updates: 7,
			total_sats_sent: 50_000,
			total_sats_received: 20_000,
			total_net_fees: 300,
		};
		let encoded = rec.encode();
		assert_eq!(encoded.len(), CHANNEL_SCALARS_LEN);
		assert_eq!(ChannelScalars::decode(&encoded).unwrap(), rec);
	}

	#[test]
	fn funding_record_round_trips() {
		let rec = FundingRecord {
			funding_outpoint: Outpoint { txid: [3u8; 32], index: 1 },
			our_multisig_key: vec![2u8; 33],
			their_multisig_key: vec![3u8; 33],
			funding_redeem_script: vec![0x52; 71],
			creation_unix: 1_700_000_000,
		};
		assert_eq!(FundingRecord::decode(&rec.encode().unwrap()).unwrap(), rec);
	}

	#[test]
	fn truncated_htlc_is_rejected_not_panicking() {
		let h = Htlc {
			incoming: true,
			amt: 1,
			rhash: [0u8; 32],
			refund_timeout: 1,
			revocation_timeout: 1,
		};
		let mut encoded = h.encode().to_vec();
		encoded.truncate(10);
		assert!(Htlc::decode(&encoded).is_err());
	}
}
