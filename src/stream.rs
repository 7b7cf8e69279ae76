//! Decoder for the daemon's multiplexed stdout/stderr stream.
//!
//! Each frame is an 8-byte header followed by its payload:
//!
//! ```text
//! [stream type: u8][0][0][0][payload length: u32 big-endian][payload ...]
//! ```
//!
//! Stream type 1 is stdout, 2 is stderr; any other type (0 is stdin) is
//! skipped. Raw socket reads split frames at arbitrary points, so the parser
//! keeps an incomplete trailing frame buffered until the rest arrives.

/// Size of a frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 8;

const STDOUT: u8 = 1;
const STDERR: u8 = 2;

/// Incremental frame decoder.
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes and extract every complete frame now available.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        let mut consumed = 0;
        while let Some((stream, payload)) = next_frame(&self.buffer[consumed..]) {
            let frame_len = FRAME_HEADER_LEN + payload.len();
            match stream {
                STDOUT => self.stdout.extend_from_slice(payload),
                STDERR => self.stderr.extend_from_slice(payload),
                _ => {}
            }
            consumed += frame_len;
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
        }
    }

    /// Accumulated `(stdout, stderr)` so far.
    pub fn output(&self) -> (&[u8], &[u8]) {
        (&self.stdout, &self.stderr)
    }

    /// Number of buffered bytes belonging to a frame that is not yet complete.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Consume the parser, returning `(stdout, stderr)`.
    ///
    /// An incomplete trailing frame is dropped.
    pub fn into_output(self) -> (Vec<u8>, Vec<u8>) {
        (self.stdout, self.stderr)
    }
}

/// Split one complete frame off the front of `buf`, if there is one.
fn next_frame(buf: &[u8]) -> Option<(u8, &[u8])> {
    let header = buf.get(..FRAME_HEADER_LEN)?;
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let payload = buf.get(FRAME_HEADER_LEN..FRAME_HEADER_LEN.checked_add(len)?)?;
    Some((header[0], payload))
}

/// Encode one frame. Used to build streams in tests and fakes.
pub fn encode_frame(stream: u8, payload: &[u8]) -> Vec<u8> {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.push(stream);
    frame.extend_from_slice(&[0, 0, 0]);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload[..len as usize]);
    frame
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_stream() -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend(encode_frame(1, b"hello "));
        stream.extend(encode_frame(2, b"warning: deprecated\n"));
        stream.extend(encode_frame(1, b"world\n"));
        stream.extend(encode_frame(0, b"ignored stdin echo"));
        stream.extend(encode_frame(1, b""));
        stream.extend(encode_frame(2, &[0xff, 0x00, 0xfe]));
        stream.extend(encode_frame(7, b"unknown stream"));
        stream.extend(encode_frame(1, &vec![b'x'; 70_000]));
        stream
    }

    fn parse_in_chunks(stream: &[u8], chunk_size: usize) -> (Vec<u8>, Vec<u8>) {
        let mut parser = StreamParser::new();
        for chunk in stream.chunks(chunk_size) {
            parser.feed(chunk);
        }
        assert_eq!(parser.pending(), 0);
        parser.into_output()
    }

    #[test]
    fn test_single_feed_demultiplexes() {
        let (stdout, stderr) = parse_in_chunks(&sample_stream(), usize::MAX);
        let mut expected_stdout = b"hello world\n".to_vec();
        expected_stdout.extend(vec![b'x'; 70_000]);
        assert_eq!(stdout, expected_stdout);
        assert_eq!(stderr, b"warning: deprecated\n\xff\x00\xfe".to_vec());
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let stream = sample_stream();
        let whole = parse_in_chunks(&stream, usize::MAX);
        for size in [1, 2, 3, 7, 8, 9, 13, 64, 4096] {
            assert_eq!(parse_in_chunks(&stream, size), whole, "chunk size {}", size);
        }
    }

    #[test]
    fn test_uneven_splits_do_not_matter() {
        let stream = sample_stream();
        let whole = parse_in_chunks(&stream, usize::MAX);
        // Split points inside headers, at header/payload seams and inside payloads.
        for split in [1, 4, 8, 10, 14, 30, 41, stream.len() - 1] {
            let mut parser = StreamParser::new();
            parser.feed(&stream[..split]);
            parser.feed(&stream[split..]);
            assert_eq!(parser.into_output(), whole, "split at {}", split);
        }
    }

    #[test]
    fn test_partial_frame_stays_buffered() {
        let frame = encode_frame(1, b"abcdef");
        let mut parser = StreamParser::new();
        parser.feed(&frame[..5]);
        assert_eq!(parser.output(), (&b""[..], &b""[..]));
        assert_eq!(parser.pending(), 5);

        parser.feed(&frame[5..10]);
        assert_eq!(parser.output().0, b"");
        assert_eq!(parser.pending(), 10);

        parser.feed(&frame[10..]);
        assert_eq!(parser.output().0, b"abcdef");
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn test_output_available_before_end_of_stream() {
        let mut stream = encode_frame(1, b"progress 1\n");
        stream.extend(encode_frame(1, b"progress 2\n"));
        let mut parser = StreamParser::new();
        parser.feed(&stream[..stream.len() - 3]);
        assert_eq!(parser.output().0, b"progress 1\n");
    }

    #[test]
    fn test_empty_feed_is_noop() {
        let mut parser = StreamParser::new();
        parser.feed(&[]);
        assert_eq!(parser.pending(), 0);
        assert_eq!(parser.into_output(), (Vec::new(), Vec::new()));
    }
}
