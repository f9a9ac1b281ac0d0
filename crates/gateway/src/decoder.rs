//! C3 Response Decoder: un-chunk, inflate, and regex-extract the vendor's
//! proprietary streaming payload into a cumulative `DecodedFrame` (§3, §8
//! "decoded-frame round-trip" property). Every function here is pure: same
//! bytes in, same frame out, no I/O.

use flate2::{Decompress, FlushDecompress};
use regex::bytes::Regex;

use crate::types::{DecodedFrame, FunctionCall};

static TOOLCALL_PATTERN: once_cell::sync::Lazy<Regex> =
	once_cell::sync::Lazy::new(|| Regex::new(r#"\[\[\[null,.*?\]\],"model"\]"#).unwrap());

/// Strips one HTTP/1.1 chunked-transfer-encoding layer off `body`, returning
/// the concatenated chunk payloads and whether the `0\r\n\r\n` terminator was
/// observed. Tolerant of a body that ends mid-chunk (the common case while
/// the upstream response is still arriving).
pub fn decode_chunked(mut body: &[u8]) -> (Vec<u8>, bool) {
	let mut out = Vec::new();
	loop {
		let Some(crlf) = find(body, b"\r\n") else {
			break;
		};
		let hex_len = &body[..crlf];
		let Ok(len_str) = std::str::from_utf8(hex_len) else {
			break;
		};
		let Ok(len) = usize::from_str_radix(len_str.trim(), 16) else {
			break;
		};
		if len == 0 {
			return (out, find(body, b"0\r\n\r\n").is_some());
		}
		let data_start = crlf + 2;
		if data_start + len > body.len() {
			break;
		}
		out.extend_from_slice(&body[data_start..data_start + len]);
		let after = data_start + len + 2;
		if after > body.len() {
			break;
		}
		body = &body[after..];
	}
	(out, false)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
	haystack
		.windows(needle.len())
		.position(|w| w == needle)
}

/// Inflates `data`, auto-detecting a gzip or zlib header the way
/// `zlib.decompressobj(wbits=zlib.MAX_WBITS | 32)` does on the source side.
/// Truncated input (the stream is still being written) yields whatever
/// prefix decoded cleanly rather than an error.
pub fn decompress_stream(data: &[u8]) -> Vec<u8> {
	if data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b {
		decompress_gzip(data)
	} else {
		decompress_zlib(data)
	}
}

fn decompress_zlib(data: &[u8]) -> Vec<u8> {
	let mut decompressor = Decompress::new(true);
	let mut out = Vec::with_capacity(data.len() * 4);
	let _ = decompressor.decompress_vec(data, &mut out, FlushDecompress::Sync);
	out
}

fn decompress_gzip(data: &[u8]) -> Vec<u8> {
	// Skip the fixed 10-byte gzip header; ignore FLG extras (not used by this
	// upstream) and the trailing CRC32+ISIZE, which truncated streams won't have anyway.
	if data.len() < 10 {
		return Vec::new();
	}
	let mut decompressor = Decompress::new(false);
	let mut out = Vec::with_capacity(data.len() * 4);
	let _ = decompressor.decompress_vec(&data[10..], &mut out, FlushDecompress::Sync);
	out
}

/// Regex-extracts `[[[null, ...]], "model"]` records from the inflated
/// payload and folds them into a cumulative frame: a 2-element payload is a
/// body delta, an 11-element payload with a null second slot and a list in
/// slot 10 is a tool call, anything else with more than 2 elements is a
/// reasoning delta.
pub fn parse_response(data: &[u8]) -> DecodedFrame {
	let mut frame = DecodedFrame::default();
	for m in TOOLCALL_PATTERN.find_iter(data) {
		let Ok(value) = serde_json::from_slice::<serde_json::Value>(m.as_bytes()) else {
			continue;
		};
		let Some(payload) = value.get(0).and_then(|v| v.get(0)).and_then(|v| v.as_array()) else {
			continue;
		};
		match payload.len() {
			2 => {
				if let Some(delta) = payload[1].as_str() {
					frame.body.push_str(delta);
				}
			},
			11 if payload[1].is_null() && payload[10].is_array() => {
				let tool_call_array = payload[10].as_array().unwrap();
				let Some(name) = tool_call_array.first().and_then(|v| v.as_str()) else {
					continue;
				};
				let params = tool_call_array
					.get(1)
					.map(parse_toolcall_params)
					.unwrap_or(serde_json::Value::Object(Default::default()));
				frame.function.push(FunctionCall {
					name: name.to_string(),
					params,
				});
			},
			n if n > 2 => {
				if let Some(delta) = payload[1].as_str() {
					frame.reason.push_str(delta);
				}
			},
			_ => {},
		}
	}
	frame
}

/// Recursively unpacks the vendor's positional tool-call argument encoding
/// into a plain JSON object. Each named argument rides as
/// `[name, [tag, ...values]]` where `tag` (the array length) selects which
/// slot carries the actual value; `tag == 5` nests another argument list.
fn parse_toolcall_params(args: &serde_json::Value) -> serde_json::Value {
	let mut out = serde_json::Map::new();
	let Some(params) = args.get(0).and_then(|v| v.as_array()) else {
		return serde_json::Value::Object(out);
	};
	for param in params {
		let Some(param) = param.as_array() else { continue };
		let (Some(name), Some(value)) = (param.first().and_then(|v| v.as_str()), param.get(1)) else {
			continue;
		};
		let Some(value_array) = value.as_array() else {
			continue;
		};
		let resolved = match value_array.len() {
			1 => serde_json::Value::Null,
			2 => value_array[1].clone(),
			3 => value_array[2].clone(),
			4 => serde_json::Value::Bool(value_array[3] == serde_json::json!(1)),
			5 => parse_toolcall_params(&value_array[4]),
			_ => continue,
		};
		out.insert(name.to_string(), resolved);
	}
	serde_json::Value::Object(out)
}

/// Full pipeline: un-chunk, inflate, regex-extract, and flag completion.
/// Pure given the same byte buffer (§8's round-trip idempotence property).
pub fn decode_response(body: &[u8]) -> DecodedFrame {
	let (chunked, done) = decode_chunked(body);
	let inflated = decompress_stream(&chunked);
	let mut frame = parse_response(&inflated);
	frame.done = done;
	frame
}

#[cfg(test)]
mod tests {
	use super::*;
	use flate2::Compression;
	use flate2::write::ZlibEncoder;
	use std::io::Write;

	fn chunked(payload: &[u8], terminate: bool) -> Vec<u8> {
		let mut out = Vec::new();
		out.extend_from_slice(format!("{:x}\r\n", payload.len()).as_bytes());
		out.extend_from_slice(payload);
		out.extend_from_slice(b"\r\n");
		if terminate {
			out.extend_from_slice(b"0\r\n\r\n");
		}
		out
	}

	fn zlib_compress(data: &[u8]) -> Vec<u8> {
		let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
		enc.write_all(data).unwrap();
		enc.finish().unwrap()
	}

	#[test]
	fn dechunk_single_chunk_without_terminator() {
		let (data, done) = decode_chunked(&chunked(b"hello", false));
		assert_eq!(data, b"hello");
		assert!(!done);
	}

	#[test]
	fn dechunk_detects_terminator() {
		let mut body = chunked(b"hello", false);
		body.extend_from_slice(b"0\r\n\r\n");
		let (data, done) = decode_chunked(&body);
		assert_eq!(data, b"hello");
		assert!(done);
	}

	#[test]
	fn dechunk_tolerates_truncated_trailing_chunk() {
		let mut body = chunked(b"first", false);
		body.extend_from_slice(b"a\r\nunfinishe"); // declares 10 bytes, only 10 present but no trailing CRLF
		let (data, done) = decode_chunked(&body);
		assert_eq!(data, b"first");
		assert!(!done);
	}

	#[test]
	fn parse_response_accumulates_body_and_reason() {
		let raw = br#"[[[null,"He"]],"model"][[[null,null,"thinking"]],"model"]"#;
		let frame = parse_response(raw);
		assert_eq!(frame.body, "He");
		assert_eq!(frame.reason, "thinking");
	}

	#[test]
	fn parse_response_extracts_tool_call() {
		let raw = br#"[[[null,null,0,0,0,0,0,0,0,0,["my_fn",[[["x",[0,1]]]]]]],"model"]"#;
		let frame = parse_response(raw);
		assert_eq!(frame.function.len(), 1);
		assert_eq!(frame.function[0].name, "my_fn");
		assert_eq!(frame.function[0].params.get("x").unwrap(), &serde_json::json!(1));
	}

	#[test]
	fn decode_response_round_trips() {
		let inner = br#"[[[null,"Hello"]],"model"]"#;
		let compressed = zlib_compress(inner);
		let mut body = chunked(&compressed, false);
		body.extend_from_slice(b"0\r\n\r\n");
		let a = decode_response(&body);
		let b = decode_response(&body);
		assert_eq!(a.body, "Hello");
		assert_eq!(a.body, b.body);
		assert_eq!(a.reason, b.reason);
		assert!(a.done);
	}
}
