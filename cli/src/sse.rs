//! `text/event-stream` の行パーサー
//!
//! ネットワークから届くチャンクはフレームやUTF-8文字の途中で分割されることがあるため、
//! 完結した行だけを解釈し、残りは次のチャンクまで保持する。

/// 1つのSSEフレーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` フィールド（省略時は `None`）
    pub event: Option<String>,
    /// `data:` 行を `\n` で連結した値
    pub data: String,
}

impl SseFrame {
    pub fn is_error(&self) -> bool {
        self.event.as_deref() == Some("error")
    }
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// チャンクを追加し、完結したフレームを返す
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let decoded = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = decoded.strip_suffix('\r').unwrap_or(&*decoded);

            if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// ストリーム終了時に、空行で閉じられていないフレームを取り出す
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).into_owned();
            if let Some(frame) = self.process_line(line.trim_end_matches('\r')) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame { event, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(text: &str) -> SseFrame {
        SseFrame {
            event: None,
            data: text.to_string(),
        }
    }

    #[test]
    fn test_parses_frames_in_order() {
        let mut parser = SseParser::new();
        let frames = parser.push(b"data: hi\n\ndata:  there\n\n");
        assert_eq!(frames, vec![data("hi"), data(" there")]);
    }

    #[test]
    fn test_frames_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"da").is_empty());
        assert!(parser.push(b"ta: hel").is_empty());
        assert!(parser.push(b"lo\n").is_empty());
        assert_eq!(parser.push(b"\ndata: x\r\n\r\n"), vec![data("hello"), data("x")]);
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        let text = "data: こんにちは\n\n".as_bytes();
        let (head, tail) = text.split_at(8);

        let mut parser = SseParser::new();
        assert!(parser.push(head).is_empty());
        assert_eq!(parser.push(tail), vec![data("こんにちは")]);
    }

    #[test]
    fn test_multiline_data_is_joined() {
        let mut parser = SseParser::new();
        assert_eq!(parser.push(b"data: a\ndata: b\n\n"), vec![data("a\nb")]);
    }

    #[test]
    fn test_error_event() {
        let mut parser = SseParser::new();
        let frames = parser.push(b"data: partial\n\nevent: error\ndata: Agent processing failed\n\n");
        assert_eq!(frames.len(), 2);
        assert!(!frames[0].is_error());
        assert!(frames[1].is_error());
        assert_eq!(frames[1].data, "Agent processing failed");
    }

    #[test]
    fn test_comments_and_unknown_fields_are_ignored() {
        let mut parser = SseParser::new();
        let frames = parser.push(b": keep-alive\n\nid: 1\nretry: 10\ndata: ok\n\n");
        assert_eq!(frames, vec![data("ok")]);
    }

    #[test]
    fn test_finish_flushes_unterminated_frame() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: tail").is_empty());
        assert_eq!(parser.finish(), Some(data("tail")));
        assert_eq!(parser.finish(), None);
    }
}
