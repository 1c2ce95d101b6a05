use tokio::io::{AsyncRead, AsyncReadExt};

/// Default line buffer bound. The wire protocol assumes lines no longer than
/// this; a longer line is silently truncated at the boundary rather than
/// signaled as an error.
pub const MAX_LINE_LEN: usize = 4096;

/// Outcome of a single [`read_line`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum LineOutcome {
    /// A full line was read (newline trimmed, never included in `line`).
    Line,
    /// The stream ended with no bytes read.
    Eof,
}

/// Framed reader over a byte stream: reads until `\n` or until the internal
/// buffer reaches [`MAX_LINE_LEN`], whichever comes first.
///
/// Over-long lines are truncated at the buffer boundary; bytes beyond the
/// bound are discarded up to (and including) the next newline so the stream
/// resynchronizes on the following call.
pub struct LineReader<R> {
    inner: R,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        LineReader {
            inner,
            max_len: MAX_LINE_LEN,
        }
    }

    pub fn with_max_len(inner: R, max_len: usize) -> Self {
        LineReader { inner, max_len }
    }

    /// Reads one line into `dst` (cleared first). Returns [`LineOutcome::Eof`]
    /// when the stream ends before any bytes were read for this line.
    ///
    /// Every byte up to `max_len` counts toward the line, ASCII or not;
    /// bytes beyond that bound are dropped without affecting the bytes
    /// already buffered, so a truncated line never shifts or loses a byte
    /// that arrived before the boundary. The buffered bytes are decoded
    /// with a lossy UTF-8 conversion (any non-UTF-8 byte becomes `U+FFFD`)
    /// rather than panicking on wire garbage.
    pub async fn read_line(&mut self, dst: &mut String) -> std::io::Result<LineOutcome> {
        let mut raw: Vec<u8> = Vec::new();
        let mut saw_any_byte = false;
        let mut byte = [0u8; 1];
        loop {
            let n = self.inner.read(&mut byte).await?;
            if n == 0 {
                if saw_any_byte {
                    break;
                }
                return Ok(LineOutcome::Eof);
            }
            saw_any_byte = true;
            if byte[0] == b'\n' {
                break;
            }
            if raw.len() < self.max_len {
                raw.push(byte[0]);
            }
        }
        dst.clear();
        dst.push_str(&String::from_utf8_lossy(&raw));
        Ok(LineOutcome::Line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn reads_a_simple_line() {
        let mut reader = LineReader::new(Cursor::new(b"hello\nworld\n".to_vec()));
        let mut buf = String::new();
        assert_eq!(reader.read_line(&mut buf).await.unwrap(), LineOutcome::Line);
        assert_eq!(buf, "hello");
        assert_eq!(reader.read_line(&mut buf).await.unwrap(), LineOutcome::Line);
        assert_eq!(buf, "world");
    }

    #[tokio::test]
    async fn reports_eof_with_no_trailing_newline_data() {
        let mut reader = LineReader::new(Cursor::new(b"".to_vec()));
        let mut buf = String::new();
        assert_eq!(reader.read_line(&mut buf).await.unwrap(), LineOutcome::Eof);
    }

    #[tokio::test]
    async fn returns_final_partial_line_on_stream_end() {
        let mut reader = LineReader::new(Cursor::new(b"trailing".to_vec()));
        let mut buf = String::new();
        assert_eq!(reader.read_line(&mut buf).await.unwrap(), LineOutcome::Line);
        assert_eq!(buf, "trailing");
    }

    #[tokio::test]
    async fn truncates_over_long_lines_at_the_buffer_boundary() {
        let long = "a".repeat(10);
        let input = format!("{long}\n");
        let mut reader = LineReader::with_max_len(Cursor::new(input.into_bytes()), 4);
        let mut buf = String::new();
        reader.read_line(&mut buf).await.unwrap();
        assert_eq!(buf, "aaaa");
    }

    #[tokio::test]
    async fn a_stray_non_ascii_byte_is_kept_in_place_rather_than_vanishing() {
        // 'a', a lone continuation byte (invalid UTF-8 on its own), then 'b'.
        let input = vec![b'a', 0xFF, b'b', b'\n'];
        let mut reader = LineReader::new(Cursor::new(input));
        let mut buf = String::new();
        reader.read_line(&mut buf).await.unwrap();
        let mut chars = buf.chars();
        assert_eq!(chars.next(), Some('a'));
        assert_eq!(chars.next(), Some('\u{FFFD}'));
        assert_eq!(chars.next(), Some('b'));
        assert_eq!(chars.next(), None);
    }
}
