//! Body framing: fixed length, chunked, or until end of stream.
//!
//! The decoder never copies. It reports spans of the input that are body
//! bytes and leaves delivery to the caller.

use crate::error::ParseErrorCode;

/// How the body of the current message is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    Fixed(u64),
    Chunked,
    UntilEof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    /// Reading hex digits; `digits` counts how many so far.
    Size { size: u64, digits: u8 },
    /// Skipping a chunk extension up to the end of the line.
    Extension { size: u64 },
    SizeLf { size: u64 },
    Data { remaining: u64 },
    DataCr,
    DataLf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decoder {
    Fixed { remaining: u64 },
    Chunked(Chunk),
    UntilEof,
}

/// What one call to [`BodyDecoder::advance`] produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// `len` body bytes starting at `start` (relative to the input).
    Data { start: usize, len: usize },
    /// The body ended after `consumed` bytes.
    Done { consumed: usize },
    /// The last chunk's size line ended after `consumed` bytes; trailers
    /// follow.
    Trailers { consumed: usize },
    /// All input consumed with the body still open.
    NeedMore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BodyError {
    pub code: ParseErrorCode,
    /// Offending byte, relative to the input.
    pub at: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BodyDecoder {
    state: Decoder,
}

impl BodyDecoder {
    pub fn new(framing: Framing) -> Self {
        let state = match framing {
            Framing::Fixed(remaining) => Decoder::Fixed { remaining },
            Framing::Chunked => Decoder::Chunked(Chunk::Size { size: 0, digits: 0 }),
            Framing::UntilEof => Decoder::UntilEof,
        };
        Self { state }
    }

    /// Whether end of stream is a clean end for this body.
    pub fn ends_at_eof(&self) -> bool {
        matches!(self.state, Decoder::UntilEof)
    }

    /// Consumes framing bytes from `input` until body data, the end of the
    /// body, or the end of input.
    pub fn advance(&mut self, input: &[u8]) -> Result<Step, BodyError> {
        match &mut self.state {
            Decoder::UntilEof => {
                if input.is_empty() {
                    Ok(Step::NeedMore)
                } else {
                    Ok(Step::Data {
                        start: 0,
                        len: input.len(),
                    })
                }
            }
            Decoder::Fixed { remaining } => {
                if *remaining == 0 {
                    return Ok(Step::Done { consumed: 0 });
                }
                if input.is_empty() {
                    return Ok(Step::NeedMore);
                }
                let len = clamp(*remaining, input.len());
                *remaining -= len as u64;
                Ok(Step::Data { start: 0, len })
            }
            Decoder::Chunked(chunk) => advance_chunked(chunk, input),
        }
    }

    /// Called after a `Data` step that emptied a fixed body.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, Decoder::Fixed { remaining: 0 })
    }
}

fn clamp(remaining: u64, available: usize) -> usize {
    usize::try_from(remaining).map_or(available, |r| r.min(available))
}

fn advance_chunked(chunk: &mut Chunk, input: &[u8]) -> Result<Step, BodyError> {
    let mut pos = 0;
    while pos < input.len() {
        let byte = input[pos];
        match *chunk {
            Chunk::Size { size, digits } => match hex_value(byte) {
                Some(value) => {
                    let size = size
                        .checked_mul(16)
                        .and_then(|s| s.checked_add(u64::from(value)))
                        .ok_or(BodyError {
                            code: ParseErrorCode::InvalidContentLength,
                            at: pos,
                        })?;
                    *chunk = Chunk::Size {
                        size,
                        digits: digits.saturating_add(1),
                    };
                }
                None if digits == 0 => {
                    return Err(BodyError {
                        code: ParseErrorCode::InvalidChunkSize,
                        at: pos,
                    });
                }
                None => match byte {
                    b'\r' => *chunk = Chunk::SizeLf { size },
                    b'\n' => {
                        pos += 1;
                        if let Some(step) = end_size_line(chunk, size, pos) {
                            return Ok(step);
                        }
                        continue;
                    }
                    b';' | b' ' | b'\t' => *chunk = Chunk::Extension { size },
                    _ => {
                        return Err(BodyError {
                            code: ParseErrorCode::InvalidChunkSize,
                            at: pos,
                        });
                    }
                },
            },
            Chunk::Extension { size } => match byte {
                b'\r' => *chunk = Chunk::SizeLf { size },
                b'\n' => {
                    pos += 1;
                    if let Some(step) = end_size_line(chunk, size, pos) {
                        return Ok(step);
                    }
                    continue;
                }
                _ => {}
            },
            Chunk::SizeLf { size } => {
                if byte != b'\n' {
                    return Err(BodyError {
                        code: ParseErrorCode::LfExpected,
                        at: pos,
                    });
                }
                pos += 1;
                if let Some(step) = end_size_line(chunk, size, pos) {
                    return Ok(step);
                }
                continue;
            }
            Chunk::Data { remaining } => {
                let len = clamp(remaining, input.len() - pos);
                let remaining = remaining - len as u64;
                *chunk = if remaining == 0 {
                    Chunk::DataCr
                } else {
                    Chunk::Data { remaining }
                };
                return Ok(Step::Data { start: pos, len });
            }
            Chunk::DataCr => {
                if byte != b'\r' {
                    return Err(BodyError {
                        code: ParseErrorCode::Strict,
                        at: pos,
                    });
                }
                *chunk = Chunk::DataLf;
            }
            Chunk::DataLf => {
                if byte != b'\n' {
                    return Err(BodyError {
                        code: ParseErrorCode::LfExpected,
                        at: pos,
                    });
                }
                *chunk = Chunk::Size { size: 0, digits: 0 };
            }
        }
        pos += 1;
    }
    Ok(Step::NeedMore)
}

/// Moves past a finished size line. Returns a step for the last chunk.
fn end_size_line(chunk: &mut Chunk, size: u64, consumed: usize) -> Option<Step> {
    if size == 0 {
        *chunk = Chunk::Size { size: 0, digits: 0 };
        return Some(Step::Trailers { consumed });
    }
    *chunk = Chunk::Data { remaining: size };
    None
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs `input` through a chunked decoder, returning the body and how the
    /// input ended.
    fn decode(input: &[u8]) -> (Vec<u8>, Result<Step, BodyError>) {
        let mut decoder = BodyDecoder::new(Framing::Chunked);
        let mut body = Vec::new();
        let mut pos = 0;
        loop {
            match decoder.advance(&input[pos..]) {
                Ok(Step::Data { start, len }) => {
                    body.extend_from_slice(&input[pos + start..pos + start + len]);
                    pos += start + len;
                }
                Ok(Step::Trailers { consumed }) => {
                    return (body, Ok(Step::Trailers { consumed: pos + consumed }));
                }
                other => return (body, other),
            }
        }
    }

    #[test]
    fn chunked_with_extension() {
        let (body, end) = decode(b"5;name=v\r\nhello\r\n1\r\n!\r\n0\r\n");
        assert_eq!(body, b"hello!");
        assert_eq!(end, Ok(Step::Trailers { consumed: 26 }));
    }

    #[test]
    fn chunk_size_must_be_hex() {
        let (_, end) = decode(b"zz\r\n");
        assert_eq!(
            end,
            Err(BodyError {
                code: ParseErrorCode::InvalidChunkSize,
                at: 0
            })
        );
    }

    #[test]
    fn chunk_data_needs_crlf() {
        let (body, end) = decode(b"2\r\nhiX");
        assert_eq!(body, b"hi");
        assert_eq!(end.unwrap_err().code, ParseErrorCode::Strict);
    }

    #[test]
    fn chunk_size_overflow() {
        let (_, end) = decode(b"fffffffffffffffff\r\n");
        assert_eq!(end.unwrap_err().code, ParseErrorCode::InvalidContentLength);
    }

    #[test]
    fn fixed_body_split() {
        let mut decoder = BodyDecoder::new(Framing::Fixed(5));
        assert_eq!(decoder.advance(b"abc"), Ok(Step::Data { start: 0, len: 3 }));
        assert!(!decoder.is_finished());
        assert_eq!(decoder.advance(b"deXYZ"), Ok(Step::Data { start: 0, len: 2 }));
        assert!(decoder.is_finished());
        assert_eq!(decoder.advance(b"XYZ"), Ok(Step::Done { consumed: 0 }));
    }

    #[test]
    fn until_eof_takes_everything() {
        let mut decoder = BodyDecoder::new(Framing::UntilEof);
        assert!(decoder.ends_at_eof());
        assert_eq!(decoder.advance(b"xyz"), Ok(Step::Data { start: 0, len: 3 }));
        assert_eq!(decoder.advance(b""), Ok(Step::NeedMore));
    }
}
