// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Composite key encoding for the nested-bucket emulation in [`super::Db`].
//!
//! There is no native notion of a "bucket" on top of a flat sorted
//! byte-keyed tree, so one is built: a bucket path is a sequence of
//! length-prefixed segments, and a value's full key is that path followed by
//! the caller's own (unprefixed) key bytes. Because every segment at a given
//! nesting level is framed with the same two-byte length prefix, bytewise
//! comparison of two full keys that share a path compares only the trailing,
//! unframed key bytes directly — which is exactly what lets big-endian
//! height and update-number keys sort numerically under cursor iteration
//! (§6 "Byte order", a hard compatibility contract).

/// Appends one length-prefixed path segment to `buf`.
pub fn push_segment(buf: &mut Vec<u8>, segment: &[u8]) {
	assert!(segment.len() <= u16::MAX as usize, "bucket path segment too long");
	buf.extend_from_slice(&(segment.len() as u16).to_be_bytes());
	buf.extend_from_slice(segment);
}

/// Builds the encoded prefix for a bucket path (no trailing leaf key).
pub fn bucket_path(segments: &[&[u8]]) -> Vec<u8> {
	let mut buf = Vec::new();
	for segment in segments {
		push_segment(&mut buf, segment);
	}
	buf
}

/// Builds the full on-disk key for `leaf` inside the bucket named by
/// `segments`. `leaf` is appended verbatim, preserving its own byte order.
pub fn leaf_key(segments: &[&[u8]], leaf: &[u8]) -> Vec<u8> {
	let mut buf = bucket_path(segments);
	buf.extend_from_slice(leaf);
	buf
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sibling_segments_of_equal_length_sort_numerically() {
		let a = bucket_path(&[b"height_index", &100u32.to_be_bytes()]);
		let b = bucket_path(&[b"height_index", &101u32.to_be_bytes()]);
		let c = bucket_path(&[b"height_index", &9u32.to_be_bytes()]);
		assert!(a < b);
		assert!(c < a, "9 must sort before 100 once both are fixed-width BE");
	}

	#[test]
	fn leaf_key_preserves_trailing_byte_order() {
		let base = leaf_key(&[b"channel_log", b"txid"], &1u32.to_be_bytes());
		let next = leaf_key(&[b"channel_log", b"txid"], &2u32.to_be_bytes());
		assert!(base < next);
	}

	#[test]
	fn distinct_segment_lengths_never_alias() {
		// Without length-prefixing, ("ab","c") and ("a","bc") would collide.
		let k1 = leaf_key(&[b"ab"], b"c");
		let k2 = leaf_key(&[b"a"], b"bc");
		assert_ne!(k1, k2);
	}
}
