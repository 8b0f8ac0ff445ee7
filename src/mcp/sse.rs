//! Server-Sent Events frame parsing for MCP responses.
//!
//! The gateway consumes only the first JSON-RPC envelope carried by the
//! stream: `data:` lines accumulate until a blank line, the accumulated
//! payload is decoded, and the frame whose id matches the request wins.
//! `event:`, `id:`, retry fields and `:` comments are tolerated and ignored.

use serde_json::Value;

use super::types::JsonRpcResponse;

/// Incremental SSE frame accumulator. Feed it lines (without trailing
/// newlines); a blank line flushes the current frame's joined data payload.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    data_lines: Vec<String>,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one line. Returns the completed data payload when the line
    /// terminates a frame that carried at least one `data:` field.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            if self.data_lines.is_empty() {
                return None;
            }
            let payload = self.data_lines.join("\n");
            self.data_lines.clear();
            return Some(payload);
        }

        // Comment line.
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            // A field with no colon is a field name with empty value.
            None => (line, ""),
        };

        if field == "data" {
            self.data_lines.push(value.to_string());
        }
        // event:, id:, retry: are ignored — the gateway is not a streaming
        // intermediary in this mode.
        None
    }
}

/// Scan a chunk of SSE text for the first JSON-RPC envelope answering
/// `expected_id`. Frames that fail to decode or carry another id are
/// discarded.
pub fn first_matching_frame(text: &str, expected_id: &Value) -> Option<JsonRpcResponse> {
    let mut acc = FrameAccumulator::new();
    for line in text.lines() {
        if let Some(payload) = acc.push_line(line) {
            if let Some(resp) = decode_if_matching(&payload, expected_id) {
                return Some(resp);
            }
        }
    }
    // A stream that ended without a trailing blank line still terminates the
    // final frame.
    if let Some(payload) = acc.push_line("") {
        if let Some(resp) = decode_if_matching(&payload, expected_id) {
            return Some(resp);
        }
    }
    None
}

fn decode_if_matching(payload: &str, expected_id: &Value) -> Option<JsonRpcResponse> {
    let resp: JsonRpcResponse = serde_json::from_str(payload).ok()?;
    if resp.matches_id(expected_id) {
        Some(resp)
    } else {
        None
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_data_frame() {
        let text = "data: {\"jsonrpc\":\"2.0\",\"result\":{\"tools\":[{\"name\":\"x\"}]},\"id\":1}\n\n";
        let resp = first_matching_frame(text, &json!(1)).unwrap();
        assert_eq!(resp.result.unwrap()["tools"][0]["name"], "x");
    }

    #[test]
    fn test_event_and_id_lines_ignored() {
        let text = concat!(
            "event: message\n",
            "id: 42\n",
            ": keepalive comment\n",
            "data: {\"jsonrpc\":\"2.0\",\"result\":7,\"id\":1}\n",
            "\n",
        );
        let resp = first_matching_frame(text, &json!(1)).unwrap();
        assert_eq!(resp.result.unwrap(), json!(7));
    }

    #[test]
    fn test_multiline_data_joined() {
        let text = concat!(
            "data: {\"jsonrpc\":\"2.0\",\n",
            "data: \"result\":true,\"id\":1}\n",
            "\n",
        );
        let resp = first_matching_frame(text, &json!(1)).unwrap();
        assert_eq!(resp.result.unwrap(), json!(true));
    }

    #[test]
    fn test_non_matching_id_discarded() {
        let text = concat!(
            "data: {\"jsonrpc\":\"2.0\",\"result\":\"stale\",\"id\":9}\n",
            "\n",
            "data: {\"jsonrpc\":\"2.0\",\"result\":\"fresh\",\"id\":2}\n",
            "\n",
        );
        let resp = first_matching_frame(text, &json!(2)).unwrap();
        assert_eq!(resp.result.unwrap(), json!("fresh"));
    }

    #[test]
    fn test_garbage_frames_skipped() {
        let text = concat!(
            "data: not json at all\n",
            "\n",
            "data: {\"jsonrpc\":\"2.0\",\"result\":1,\"id\":3}\n",
            "\n",
        );
        let resp = first_matching_frame(text, &json!(3)).unwrap();
        assert_eq!(resp.result.unwrap(), json!(1));
    }

    #[test]
    fn test_empty_stream_yields_nothing() {
        assert!(first_matching_frame("", &json!(1)).is_none());
        assert!(first_matching_frame(": ping\n\n", &json!(1)).is_none());
    }

    #[test]
    fn test_missing_trailing_blank_line() {
        let text = "data: {\"jsonrpc\":\"2.0\",\"result\":\"end\",\"id\":4}";
        let resp = first_matching_frame(text, &json!(4)).unwrap();
        assert_eq!(resp.result.unwrap(), json!("end"));
    }

    #[test]
    fn test_crlf_lines() {
        let text = "data: {\"jsonrpc\":\"2.0\",\"result\":5,\"id\":1}\r\n\r\n";
        let resp = first_matching_frame(text, &json!(1)).unwrap();
        assert_eq!(resp.result.unwrap(), json!(5));
    }

    #[test]
    fn test_error_envelope_still_returned() {
        // A JSON-RPC error with the right id is the answer — the transport
        // layer maps it to UpstreamError.
        let text = "data: {\"jsonrpc\":\"2.0\",\"error\":{\"code\":-32600,\"message\":\"bad\"},\"id\":1}\n\n";
        let resp = first_matching_frame(text, &json!(1)).unwrap();
        assert!(resp.error.is_some());
    }
}
