//! Incremental newline framing for the worker's stdout byte stream.

use serde_json::Value;

const RAW_PREVIEW_LIMIT: usize = 200;

#[derive(Debug)]
pub enum Frame {
    Message(Value),
    Invalid {
        raw: String,
        error: serde_json::Error,
    },
}

impl Frame {
    /// Truncated copy of an invalid line, suitable for a log field.
    pub fn preview(raw: &str) -> String {
        if raw.len() > RAW_PREVIEW_LIMIT {
            let mut end = RAW_PREVIEW_LIMIT;
            while !raw.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &raw[..end])
        } else {
            raw.to_string()
        }
    }
}

/// Largest unterminated line kept in memory; anything longer is dropped up to its newline.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Buffers partial output and yields one [`Frame`] per complete, non-blank line.
///
/// Bytes after the last `\n` stay buffered until a later `feed` terminates them, so a JSON
/// message split across reads is parsed exactly once. Only newly fed bytes are scanned for
/// newlines.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_frame_bytes: usize,
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::with_max_frame_bytes(MAX_FRAME_BYTES)
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_bytes,
            discarding: false,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let Some(last_newline) = bytes.iter().rposition(|byte| *byte == b'\n') else {
            self.buffer_partial(bytes);
            return Vec::new();
        };
        let (mut terminated, rest) = bytes.split_at(last_newline + 1);

        if self.discarding {
            // The oversized line ends at the first newline.
            let end = terminated
                .iter()
                .position(|byte| *byte == b'\n')
                .map_or(0, |index| index + 1);
            terminated = &terminated[end..];
            self.discarding = false;
        }

        let mut complete = std::mem::take(&mut self.buffer);
        complete.extend_from_slice(terminated);
        self.buffer_partial(rest);

        complete
            .split(|byte| *byte == b'\n')
            .filter_map(|line| {
                let text = String::from_utf8_lossy(line);
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return None;
                }
                Some(match serde_json::from_str::<Value>(trimmed) {
                    Ok(value) => Frame::Message(value),
                    Err(error) => Frame::Invalid {
                        raw: trimmed.to_string(),
                        error,
                    },
                })
            })
            .collect()
    }

    fn buffer_partial(&mut self, bytes: &[u8]) {
        if self.discarding || bytes.is_empty() {
            return;
        }
        let buffered = self.buffer.len() + bytes.len();
        if buffered > self.max_frame_bytes {
            tracing::warn!(
                buffered = buffered,
                limit = self.max_frame_bytes,
                "worker stdout: frame exceeds size limit, discarding until next newline"
            );
            self.buffer = Vec::new();
            self.discarding = true;
            return;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet terminated by a newline.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn messages(frames: Vec<Frame>) -> Vec<Value> {
        frames
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Message(value) => Some(value),
                Frame::Invalid { .. } => None,
            })
            .collect()
    }

    #[test]
    fn frame_split_across_chunks_is_emitted_once_terminated() {
        let mut framer = LineFramer::new();

        let first = framer.feed(br#"{"jsonrpc":"2.0","id":1,"res"#);
        assert!(first.is_empty());
        assert_eq!(framer.pending_len(), 28);

        let second = messages(framer.feed(b"ult\":{\"ok\":true}}\n"));
        assert_eq!(second, vec![json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}})]);
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn multiple_frames_in_one_chunk_keep_order_and_trailing_fragment() {
        let mut framer = LineFramer::new();
        let frames = messages(framer.feed(b"{\"id\":1}\n{\"id\":2}\r\n{\"id\""));

        assert_eq!(frames, vec![json!({"id": 1}), json!({"id": 2})]);
        assert_eq!(framer.pending_len(), 5);

        let rest = messages(framer.feed(b":3}\n"));
        assert_eq!(rest, vec![json!({"id": 3})]);
    }

    #[test]
    fn invalid_lines_are_reported_without_breaking_the_stream() {
        let mut framer = LineFramer::new();
        let frames = framer.feed(b"starting worker...\n\n   \n{\"id\":9}\n");

        assert_eq!(frames.len(), 2);
        match &frames[0] {
            Frame::Invalid { raw, .. } => assert_eq!(raw, "starting worker..."),
            other => panic!("expected invalid frame, got {other:?}"),
        }
        match &frames[1] {
            Frame::Message(value) => assert_eq!(value, &json!({"id": 9})),
            other => panic!("expected message frame, got {other:?}"),
        }
    }

    #[test]
    fn multibyte_character_split_between_chunks_survives() {
        let mut framer = LineFramer::new();
        let line = "{\"text\":\"caf\u{e9}\"}\n".as_bytes().to_vec();
        let split = line.len() - 4;

        assert!(framer.feed(&line[..split]).is_empty());
        let frames = messages(framer.feed(&line[split..]));
        assert_eq!(frames, vec![json!({"text": "caf\u{e9}"})]);
    }

    #[test]
    fn oversized_line_is_dropped_and_the_stream_recovers() {
        let mut framer = LineFramer::with_max_frame_bytes(16);

        assert!(framer.feed(b"{\"id\":1,\"blob\":\"").is_empty());
        assert_eq!(framer.pending_len(), 16);
        assert!(framer.feed(b"xxxxxxxxxxxxxxxx").is_empty());
        assert_eq!(framer.pending_len(), 0);
        assert!(framer.feed(b"yyyyyyyy").is_empty());
        assert_eq!(framer.pending_len(), 0);

        let frames = messages(framer.feed(b"zz\"}\n{\"id\":2}\n{\"id\""));
        assert_eq!(frames, vec![json!({"id": 2})]);
        assert_eq!(framer.pending_len(), 5);

        let rest = messages(framer.feed(b":3}\n"));
        assert_eq!(rest, vec![json!({"id": 3})]);
    }

    #[test]
    fn preview_truncates_long_lines() {
        let long = "x".repeat(500);
        let preview = Frame::preview(&long);
        assert_eq!(preview.len(), 203);
        assert!(preview.ends_with("..."));
        assert_eq!(Frame::preview("short"), "short");
    }
}
