#![forbid(unsafe_code)]

//! Newline-delimited JSON codec for the TCP edge.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default maximum encoded line length (including the trailing newline).
pub const DEFAULT_MAX_LINE_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("line exceeds maximum size: len={len} max={max}")]
	LineTooLong { len: usize, max: usize },

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Encode a value as one JSON line (terminated by `\n`).
pub fn encode_line<T: Serialize>(value: &T, max_line_size: usize) -> Result<Vec<u8>, CodecError> {
	let mut out = serde_json::to_vec(value)?;
	out.push(b'\n');
	if out.len() > max_line_size {
		return Err(CodecError::LineTooLong {
			len: out.len(),
			max: max_line_size,
		});
	}
	Ok(out)
}

/// Decode a value from one line (with or without the trailing newline).
pub fn decode_line<T: DeserializeOwned>(line: &[u8], max_line_size: usize) -> Result<T, CodecError> {
	if line.len() > max_line_size {
		return Err(CodecError::LineTooLong {
			len: line.len(),
			max: max_line_size,
		});
	}

	let trimmed = match line.last() {
		Some(b'\n') => &line[..line.len() - 1],
		_ => line,
	};
	Ok(serde_json::from_slice(trimmed)?)
}
