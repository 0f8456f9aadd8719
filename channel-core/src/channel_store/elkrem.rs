// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Forward-secret revocation hash-chain, isolated behind two small types so
//! the real elkrem/shachain tree-compaction algorithm can replace this
//! later without touching any caller — commitment-secret derivation is one
//! of the cryptographic pieces §1 names as deliberately out of scope here.

use crate::codec::CodecError;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::convert::TryInto;

/// Holds the root seed a channel party uses to derive every revocation
/// secret it will ever hand to its counterparty, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElkremSender {
	root: [u8; 32],
}

impl ElkremSender {
	pub fn new(root: [u8; 32]) -> Self {
		Self { root }
	}

	pub fn root(&self) -> [u8; 32] {
		self.root
	}

	/// Derives the secret for `index`. Any prior secret is re-derivable
	/// from the root alone — nothing about past indices needs to be
	/// persisted beyond the root itself.
	pub fn secret_for_index(&self, index: u64) -> [u8; 32] {
		let mut hasher = Sha256::new();
		hasher.update(self.root);
		hasher.update(index.to_be_bytes());
		hasher.finalize().into()
	}
}

/// Reconstructs any previously-received revocation secret by index. Stored
/// as a compact index-to-secret map rather than a compressed hash tree;
/// functionally equivalent for this crate's purposes, and easy to swap for
/// a true O(log n) elkrem tree later.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElkremReceiver {
	received: BTreeMap<u64, [u8; 32]>,
}

impl ElkremReceiver {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert_secret(&mut self, index: u64, secret: [u8; 32]) {
		self.received.insert(index, secret);
	}

	pub fn secret_for_index(&self, index: u64) -> Option<[u8; 32]> {
		self.received.get(&index).copied()
	}

	fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(4 + self.received.len() * 40);
		buf.extend_from_slice(&(self.received.len() as u32).to_be_bytes());
		for (index, secret) in &self.received {
			buf.extend_from_slice(&index.to_be_bytes());
			buf.extend_from_slice(secret);
		}
		buf
	}

	fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
		if bytes.len() < 4 {
			return Err(CodecError::UnexpectedEof { needed: 4 - bytes.len() });
		}
		let count = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
		let mut pos = 4;
		let mut received = BTreeMap::new();
		for _ in 0..count {
			if bytes.len() - pos < 40 {
				return Err(CodecError::UnexpectedEof { needed: 40 - (bytes.len() - pos) });
			}
			let index = u64::from_be_bytes(bytes[pos..pos + 8].try_into().unwrap());
			let mut secret = [0u8; 32];
			secret.copy_from_slice(&bytes[pos + 8..pos + 40]);
			received.insert(index, secret);
			pos += 40;
		}
		if pos != bytes.len() {
			return Err(CodecError::TrailingBytes(bytes.len() - pos));
		}
		Ok(Self { received })
	}
}

/// The on-disk elkrem record for one channel: our sender root plus the
/// counterparty's reconstructable receiver state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElkremState {
	pub sender: ElkremSender,
	pub receiver: ElkremReceiver,
}

impl ElkremState {
	pub fn new(sender_root: [u8; 32]) -> Self {
		Self { sender: ElkremSender::new(sender_root), receiver: ElkremReceiver::new() }
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::new();
		buf.extend_from_slice(&self.sender.root());
		buf.extend_from_slice(&self.receiver.encode());
		buf
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
		if bytes.len() < 32 {
			return Err(CodecError::UnexpectedEof { needed: 32 - bytes.len() });
		}
		let mut root = [0u8; 32];
		root.copy_from_slice(&bytes[0..32]);
		let receiver = ElkremReceiver::decode(&bytes[32..])?;
		Ok(Self { sender: ElkremSender::new(root), receiver })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sender_is_deterministic_and_reseekable() {
		let sender = ElkremSender::new([1u8; 32]);
		let a = sender.secret_for_index(5);
		let b = sender.secret_for_index(5);
		let c = sender.secret_for_index(6);
		assert_eq!(a, b);
		assert_ne!(a, c);
	}

	#[test]
	fn receiver_reconstructs_by_index() {
		let mut receiver = ElkremReceiver::new();
		receiver.insert_secret(3, [9u8; 32]);
		assert_eq!(receiver.secret_for_index(3), Some([9u8; 32]));
		assert_eq!(receiver.secret_for_index(4), None);
	}

	#[test]
	fn elkrem_state_round_trips() {
		let mut state = ElkremState::new([2u8; 32]);
		state.receiver.insert_secret(0, [3u8; 32]);
		state.receiver.insert_secret(1, [4u8; 32]);
		assert_eq!(ElkremState::decode(&state.encode()).unwrap(), state);
	}
}
