//! Decoding of raw request bodies into envelopes.
//!
//! Accepted shapes:
//! - a single JSON object
//! - a JSON array of objects
//! - whitespace/newline-delimited JSON objects
//!
//! Parsing is all-or-nothing: any decode error discards everything read so far.

use std::io::{BufRead, BufReader, Read};

use serde_json::Deserializer;

use crate::envelope::Envelope;

/// Errors from stream parsing.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed event JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Turns a byte stream into envelopes.
pub trait StreamParser: Send + Sync {
    fn parse(&self, reader: &mut dyn Read) -> Result<Vec<Envelope>, ParseError>;
}

/// JSON object / array / NDJSON parser.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonStreamParser;

impl StreamParser for JsonStreamParser {
    fn parse(&self, reader: &mut dyn Read) -> Result<Vec<Envelope>, ParseError> {
        parse(reader)
    }
}

/// Parse every envelope in `reader`.
///
/// Peeks at the first non-whitespace byte: `[` means one JSON array,
/// anything else a sequence of objects read until end of input.
pub fn parse<R: Read>(reader: R) -> Result<Vec<Envelope>, ParseError> {
    let mut reader = BufReader::new(reader);

    let first = match skip_whitespace(&mut reader)? {
        Some(b) => b,
        None => return Ok(Vec::new()),
    };

    if first == b'[' {
        let events: Vec<Envelope> = serde_json::from_reader(reader)?;
        return Ok(events);
    }

    Deserializer::from_reader(reader)
        .into_iter::<Envelope>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(ParseError::from)
}

/// Parse an in-memory body.
pub fn parse_slice(body: &[u8]) -> Result<Vec<Envelope>, ParseError> {
    parse(body)
}

/// Consume leading whitespace and return the next byte without consuming it.
fn skip_whitespace<R: BufRead>(reader: &mut R) -> std::io::Result<Option<u8>> {
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(None);
        }
        match buf.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(i) => {
                let b = buf[i];
                reader.consume(i);
                return Ok(Some(b));
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }
}
