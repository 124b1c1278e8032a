//! HTTP/1.1 chunked transfer-encoding codec.
//!
//! Ported from the chunk filter's `incomingChunkData`/`outgoingChunkService`/
//! `setChunkPrefix` state machine: decoding walks `Start -> Data -> Start ...
//! -> Eof`; encoding emits a `\r\n{hex}\r\n` size prefix per chunk (or the
//! `\r\n0\r\n\r\n` terminator), and prefix bytes never count toward body size
//! accounting.

use memchr::memchr;

/// Decoder state, mirroring `rx->chunkState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Start,
    Data,
    Eof,
}

/// Errors produced while decoding a chunked body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkError {
    /// The chunk-size line was malformed (missing CRLF, non-hex digit, or negative size).
    BadChunkSize,
}

/// Result of feeding a buffer to [`ChunkDecoder::feed`].
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkEvent<'a> {
    /// No complete chunk header/data is available yet; call again with more bytes.
    NeedMore,
    /// A slice of chunk data, with the number of input bytes it consumed.
    Data(&'a [u8], usize),
    /// The terminating zero-length chunk was seen; decoding is complete.
    End(usize),
}

/// Decodes a chunked transfer-encoded request body incrementally.
#[derive(Debug, Clone)]
pub struct ChunkDecoder {
    state: ChunkState,
    remaining: usize,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Start,
            remaining: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == ChunkState::Eof
    }

    /// Feeds the decoder the next unconsumed bytes of the stream. Returns
    /// how many bytes were consumed and what happened; callers drive this in
    /// a loop, advancing their read cursor by the returned count each time.
    pub fn feed<'a>(&mut self, buf: &'a [u8]) -> Result<ChunkEvent<'a>, ChunkError> {
        match self.state {
            ChunkState::Start => self.parse_chunk_header(buf),
            ChunkState::Data => {
                if buf.is_empty() {
                    return Ok(ChunkEvent::NeedMore);
                }
                let take = buf.len().min(self.remaining);
                self.remaining -= take;
                if self.remaining == 0 {
                    self.state = ChunkState::Start;
                }
                Ok(ChunkEvent::Data(&buf[..take], take))
            }
            ChunkState::Eof => Ok(ChunkEvent::End(0)),
        }
    }

    // Validates the leading `\r\n` (absent on the very first chunk), then a
    // hex size run terminated by `\r\n`. A size of zero transitions to Eof
    // and tolerates a missing trailing CRLF on the terminator line.
    fn parse_chunk_header<'a>(&mut self, buf: &'a [u8]) -> Result<ChunkEvent<'a>, ChunkError> {
        let rest = if let Some(stripped) = buf.strip_prefix(b"\r\n") {
            stripped
        } else {
            buf
        };
        let prefix_len = buf.len() - rest.len();

        let Some(nl) = memchr(b'\n', rest) else {
            return Ok(ChunkEvent::NeedMore);
        };
        let line = rest[..nl].strip_suffix(b"\r").unwrap_or(&rest[..nl]);
        // Strip chunk extensions (";name=value") the way stoi's caller would
        // never see them: only the hex digits before ';' matter.
        let size_str = match memchr(b';', line) {
            Some(i) => &line[..i],
            None => line,
        };
        if size_str.is_empty() {
            return Err(ChunkError::BadChunkSize);
        }

        let size = parse_hex(size_str).ok_or(ChunkError::BadChunkSize)?;
        let consumed = prefix_len + nl + 1;

        if size == 0 {
            self.state = ChunkState::Eof;
            return Ok(ChunkEvent::End(consumed));
        }
        self.state = ChunkState::Data;
        self.remaining = size;
        Ok(ChunkEvent::NeedMore)
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_hex(bytes: &[u8]) -> Option<usize> {
    let mut result: usize = 0;
    for &b in bytes {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return None,
        };
        result = result.checked_mul(16)?.checked_add(digit as usize)?;
    }
    Some(result)
}

/// Writes the `\r\n{hex}\r\n` prefix for a chunk of `size` bytes, or the
/// `\r\n0\r\n\r\n` terminator when `size` is zero. Matches `setChunkPrefix`.
/// Returns the formatted prefix; these bytes are never counted toward queue
/// or packet byte accounting.
pub fn chunk_prefix(size: usize) -> Vec<u8> {
    if size == 0 {
        return b"\r\n0\r\n\r\n".to_vec();
    }
    format!("\r\n{size:x}\r\n").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_chunk_then_terminator() {
        let mut dec = ChunkDecoder::new();
        let input = b"5\r\nhello\r\n0\r\n\r\n";

        let mut pos = 0;
        let event = dec.feed(&input[pos..]).unwrap();
        assert_eq!(event, ChunkEvent::NeedMore);
        pos += "5\r\n".len();

        let event = dec.feed(&input[pos..]).unwrap();
        match event {
            ChunkEvent::Data(data, consumed) => {
                assert_eq!(data, b"hello");
                pos += consumed;
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let event = dec.feed(&input[pos..]).unwrap();
        assert_eq!(event, ChunkEvent::NeedMore);
        pos += "\r\n".len();

        let event = dec.feed(&input[pos..]).unwrap();
        assert!(matches!(event, ChunkEvent::End(_)));
        assert!(dec.is_complete());
    }

    #[test]
    fn rejects_non_hex_size() {
        let mut dec = ChunkDecoder::new();
        assert_eq!(dec.feed(b"zz\r\ndata"), Err(ChunkError::BadChunkSize));
    }

    #[test]
    fn chunk_prefix_formats_hex_size() {
        assert_eq!(chunk_prefix(255), b"\r\nff\r\n".to_vec());
        assert_eq!(chunk_prefix(0), b"\r\n0\r\n\r\n".to_vec());
    }

    #[test]
    fn strips_chunk_extension() {
        let mut dec = ChunkDecoder::new();
        let event = dec.feed(b"a;ext=1\r\n").unwrap();
        assert_eq!(event, ChunkEvent::NeedMore);
        assert_eq!(dec.remaining, 10);
    }
}
