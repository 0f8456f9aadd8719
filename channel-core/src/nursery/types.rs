// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The nursery's tagged union of on-chain outputs, modeled as an explicit
//! enum at the API boundary rather than as stringly-typed key prefixes
//! (§9 "tagged unions over prefixes").

use crate::codec::{CodecError, Outpoint};
use std::convert::TryInto;

/// A CSV-delayed output produced by a channel closure, on its way to being
/// swept once `conf_height + blocks_to_maturity` is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KidOutput {
	pub origin_chan_point: Outpoint,
	pub outpoint: Outpoint,
	pub amount: u64,
	pub conf_height: u32,
	pub blocks_to_maturity: u32,
}

impl KidOutput {
	pub fn maturity_height(&self) -> u32 {
		self.conf_height + self.blocks_to_maturity
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(37 * 2 + 8 + 4 + 4);
		buf.extend_from_slice(&self.origin_chan_point.encode());
		buf.extend_from_slice(&self.outpoint.encode());
		buf.extend_from_slice(&self.amount.to_be_bytes());
		buf.extend_from_slice(&self.conf_height.to_be_bytes());
		buf.extend_from_slice(&self.blocks_to_maturity.to_be_bytes());
		buf
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
		// Both outpoints are self-delimiting (var-byte(32) || u32), so decode
		// by splitting on the fixed prefix length each one consumes: 1 (len
		// byte for 32) + 32 + 4 = 37 bytes.
		const OUTPOINT_LEN: usize = 37;
		if bytes.len() < OUTPOINT_LEN * 2 + 16 {
			return Err(CodecError::UnexpectedEof {
				needed: OUTPOINT_LEN * 2 + 16 - bytes.len(),
			});
		}
		let origin_chan_point = Outpoint::decode(&bytes[0..OUTPOINT_LEN])?;
		let outpoint = Outpoint::decode(&bytes[OUTPOINT_LEN..OUTPOINT_LEN * 2])?;
		let rest = &bytes[OUTPOINT_LEN * 2..];
		let amount = u64::from_be_bytes(rest[0..8].try_into().unwrap());
		let conf_height = u32::from_be_bytes(rest[8..12].try_into().unwrap());
		let blocks_to_maturity = u32::from_be_bytes(rest[12..16].try_into().unwrap());
		if rest.len() != 16 {
			return Err(CodecError::TrailingBytes(rest.len() - 16));
		}
		Ok(Self { origin_chan_point, outpoint, amount, conf_height, blocks_to_maturity })
	}
}

/// An HTLC output awaiting its absolute CLTV expiry, carrying the
/// second-stage output it will become once the expiry passes and the
/// sweep transaction confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BabyOutput {
	pub expiry: u32,
	pub kid: KidOutput,
}

impl BabyOutput {
	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(4 + 94);
		buf.extend_from_slice(&self.expiry.to_be_bytes());
		buf.extend_from_slice(&self.kid.encode());
		buf
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
		if bytes.len() < 4 {
			return Err(CodecError::UnexpectedEof { needed: 4 - bytes.len() });
		}
		let expiry = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
		let kid = KidOutput::decode(&bytes[4..])?;
		Ok(Self { expiry, kid })
	}
}

/// The class an output currently belongs to, surfaced to callers as a
/// variant rather than as a raw 4-byte prefix tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NurseryOutput {
	Crib(BabyOutput),
	Preschool(KidOutput),
	Kindergarten(KidOutput),
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_kid() -> KidOutput {
		KidOutput {
			origin_chan_point: Outpoint { txid: [1u8; 32], index: 0 },
			outpoint: Outpoint { txid: [2u8; 32], index: 1 },
			amount: 50_000,
			conf_height: 120,
			blocks_to_maturity: 10,
		}
	}

	#[test]
	fn kid_output_round_trips() {
		let kid = sample_kid();
		assert_eq!(KidOutput::decode(&kid.encode()).unwrap(), kid);
		assert_eq!(kid.maturity_height(), 130);
	}

	#[test]
	fn baby_output_round_trips() {
		let baby = BabyOutput { expiry: 100, kid: sample_kid() };
		assert_eq!(BabyOutput::decode(&baby.encode()).unwrap(), baby);
	}
}
