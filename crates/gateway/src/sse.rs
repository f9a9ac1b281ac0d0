//! OpenAI-shaped SSE chunk construction (§4.2.3, §8 scenario 1/2). Pure
//! builders; nothing here touches I/O.

use rand::Rng;
use serde_json::{Value, json};

use crate::types::FunctionCall;

pub const DONE: &str = "data: [DONE]\n\n";

pub fn format_sse_line(value: &Value) -> String {
	format!("data: {}\n\n", value)
}

/// `call_<24 lowercase alphanumerics>`, the synthetic tool-call id format.
pub fn synthetic_tool_call_id() -> String {
	const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
	let mut rng = rand::rng();
	let suffix: String = (0..24)
		.map(|_| {
			let idx = rng.random_range(0..ALPHABET.len());
			ALPHABET[idx] as char
		})
		.collect();
	format!("call_{suffix}")
}

/// A length/4-ish heuristic estimate, not a real tokenizer (§4.2.3 "Usage
/// accounting" — matches the corpus's own `estimate_tokens` shape).
pub fn estimate_tokens(text: &str) -> u32 {
	((text.chars().count() as f64) / 4.0).ceil() as u32
}

pub fn usage_object(prompt_text: &str, completion_text: &str) -> Value {
	let prompt_tokens = estimate_tokens(prompt_text);
	let completion_tokens = estimate_tokens(completion_text);
	json!({
		"prompt_tokens": prompt_tokens,
		"completion_tokens": completion_tokens,
		"total_tokens": prompt_tokens + completion_tokens,
		"estimated": true,
	})
}

fn base_chunk(id: &str, created: i64, model: &str, delta: Value, finish_reason: Option<&str>) -> Value {
	json!({
		"id": id,
		"object": "chat.completion.chunk",
		"created": created,
		"model": model,
		"choices": [{
			"index": 0,
			"delta": delta,
			"finish_reason": finish_reason,
		}],
	})
}

pub fn reasoning_delta_chunk(id: &str, created: i64, model: &str, delta_reason: &str) -> Value {
	base_chunk(id, created, model, json!({"reasoning_content": delta_reason}), None)
}

pub fn content_delta_chunk(id: &str, created: i64, model: &str, delta_body: &str) -> Value {
	base_chunk(id, created, model, json!({"content": delta_body}), None)
}

pub fn tool_calls_chunk(id: &str, created: i64, model: &str, functions: &[FunctionCall]) -> Value {
	let tool_calls: Vec<Value> = functions
		.iter()
		.map(|f| {
			json!({
				"id": synthetic_tool_call_id(),
				"type": "function",
				"function": {
					"name": f.name,
					"arguments": serde_json::to_string(&f.params).unwrap_or_else(|_| "{}".to_string()),
				},
			})
		})
		.collect();
	base_chunk(id, created, model, json!({"tool_calls": tool_calls}), Some("tool_calls"))
}

pub fn stop_chunk(id: &str, created: i64, model: &str) -> Value {
	base_chunk(id, created, model, json!({}), Some("stop"))
}

pub fn usage_chunk(id: &str, created: i64, model: &str, prompt_text: &str, completion_text: &str) -> Value {
	json!({
		"id": id,
		"object": "chat.completion.chunk",
		"created": created,
		"model": model,
		"choices": [],
		"usage": usage_object(prompt_text, completion_text),
	})
}

pub fn non_streaming_response(
	id: &str,
	created: i64,
	model: &str,
	content: &str,
	reasoning_content: &str,
	functions: &[FunctionCall],
	prompt_text: &str,
) -> Value {
	let (message, finish_reason) = if !functions.is_empty() {
		let tool_calls: Vec<Value> = functions
			.iter()
			.map(|f| {
				json!({
					"id": synthetic_tool_call_id(),
					"type": "function",
					"function": {
						"name": f.name,
						"arguments": serde_json::to_string(&f.params).unwrap_or_else(|_| "{}".to_string()),
					},
				})
			})
			.collect();
		(json!({"role": "assistant", "content": null, "tool_calls": tool_calls}), "tool_calls")
	} else {
		let mut msg = json!({"role": "assistant", "content": content});
		if !reasoning_content.is_empty() {
			msg["reasoning_content"] = json!(reasoning_content);
		}
		(msg, "stop")
	};
	json!({
		"id": id,
		"object": "chat.completion",
		"created": created,
		"model": model,
		"choices": [{
			"index": 0,
			"message": message,
			"finish_reason": finish_reason,
		}],
		"usage": usage_object(prompt_text, content),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn synthetic_tool_call_id_matches_shape() {
		let id = synthetic_tool_call_id();
		assert!(id.starts_with("call_"));
		let suffix = &id[5..];
		assert_eq!(suffix.len(), 24);
		assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
	}

	#[test]
	fn estimate_tokens_is_length_over_four() {
		assert_eq!(estimate_tokens(""), 0);
		assert_eq!(estimate_tokens("abcd"), 1);
		assert_eq!(estimate_tokens("abcdefgh"), 2);
	}

	#[test]
	fn content_delta_chunk_has_no_finish_reason() {
		let v = content_delta_chunk("id1", 0, "m", "He");
		assert_eq!(v["choices"][0]["delta"]["content"], "He");
		assert!(v["choices"][0]["finish_reason"].is_null());
	}

	#[test]
	fn tool_calls_chunk_has_stop_reason_tool_calls() {
		let funcs = vec![FunctionCall {
			name: "fn".to_string(),
			params: json!({"x": 1}),
		}];
		let v = tool_calls_chunk("id1", 0, "m", &funcs);
		assert_eq!(v["choices"][0]["finish_reason"], "tool_calls");
		assert_eq!(v["choices"][0]["delta"]["tool_calls"][0]["function"]["name"], "fn");
	}

	#[test]
	fn format_sse_line_wraps_data_prefix() {
		let line = format_sse_line(&json!({"a": 1}));
		assert!(line.starts_with("data: "));
		assert!(line.ends_with("\n\n"));
	}
}
