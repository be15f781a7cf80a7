//! Incremental SSE decoding shared by the streaming providers.
//!
//! Providers feed raw body bytes in; complete `event:`/`data:` frames come
//! out. A partial line at a chunk boundary is carried until the rest of it
//! arrives, so frames never split across reads.

/// One complete frame: the event name (when the stream names its events,
/// as Anthropic's API does) and the data payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    pending_event: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of bytes; returns every frame it completed.
    /// Non-UTF8 chunks are dropped whole.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        self.buffer.push_str(text);

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim();
            // Blank separators and ": keepalive" comments carry nothing.
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(name) = line.strip_prefix("event:") {
                self.pending_event = Some(name.trim().to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                frames.push(SseFrame {
                    event: self.pending_event.take(),
                    data: data.trim().to_string(),
                });
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_split_across_chunks_is_reassembled() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"event: message_start\ndata: {\"a\"").is_empty());
        let frames = decoder.feed(b":1}\n\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: Some("message_start".into()),
                data: r#"{"a":1}"#.into(),
            }]
        );
    }

    #[test]
    fn unnamed_data_frames_have_no_event() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"data: {\"x\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(frames.len(), 2);
        assert!(frames[0].event.is_none());
        assert_eq!(frames[1].data, "[DONE]");
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b": keepalive\n\n\n").is_empty());
    }

    #[test]
    fn event_name_applies_to_next_data_only() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"event: tick\ndata: 1\ndata: 2\n");
        assert_eq!(frames[0].event.as_deref(), Some("tick"));
        assert!(frames[1].event.is_none());
    }
}
