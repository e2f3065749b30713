//! Statgram decoding.
//!
//! Datagrams are parsed line by line. Two pieces of state persist across
//! lines: the previous effective line, which front-compressed lines copy
//! their prefix from, and the output arena the caller hands in. Nothing is
//! allocated per datagram beyond what the decoded samples themselves need.

use std::str;

use crate::{Error, Kind, Sample, Statgram, MAX_LINE_LEN};

/// A reusable statgram decoder.
///
/// The parser owns a preallocated previous-line buffer and an expansion
/// scratch buffer, both recycled across datagrams. Parse errors are
/// confined to the field or line that produced them; a datagram as a whole
/// never fails to parse.
#[derive(Debug)]
pub struct Parser {
    prev: Vec<u8>,
    expanded: Vec<u8>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            prev: Vec::with_capacity(MAX_LINE_LEN),
            expanded: Vec::with_capacity(MAX_LINE_LEN),
        }
    }

    /// Decode one datagram, appending samples to `out` in wire order. The
    /// arena is cleared first so a recycled buffer can be passed straight
    /// back in.
    pub fn parse_into(&mut self, datagram: &[u8], out: &mut Statgram) {
        out.clear();
        self.prev.clear();
        for line in datagram.split(|&b| b == b'\n') {
            self.parse_line(line, out);
        }
    }

    /// Decode one datagram into a freshly allocated statgram.
    #[must_use]
    pub fn parse(&mut self, datagram: &[u8]) -> Statgram {
        let mut out = Statgram::new();
        self.parse_into(datagram, &mut out);
        out
    }

    fn parse_line(&mut self, raw: &[u8], out: &mut Statgram) {
        let Self { prev, expanded } = self;
        let mut line = raw;
        if raw.len() > 2 && raw[0] == b'^' {
            if let Some(prefix_len) = hex_pair(raw[1], raw[2]) {
                let suffix = &raw[3..];
                if prefix_len > prev.len() || prefix_len + suffix.len() > MAX_LINE_LEN {
                    // The compressed line never materializes, so the next
                    // one must not chain through it.
                    prev.clear();
                    return;
                }
                expanded.clear();
                expanded.extend_from_slice(&prev[..prefix_len]);
                expanded.extend_from_slice(suffix);
                line = expanded.as_slice();
            }
        }
        prev.clear();
        if line.len() <= MAX_LINE_LEN {
            prev.extend_from_slice(line);
        }
        // Field errors abort the line but keep the fields decoded so far.
        let _ = parse_line_fields(line, out);
    }
}

fn hex_pair(hi: u8, lo: u8) -> Option<usize> {
    let hi = (hi as char).to_digit(16)?;
    let lo = (lo as char).to_digit(16)?;
    Some((hi * 16 + lo) as usize)
}

fn parse_line_fields(line: &[u8], out: &mut Statgram) -> Result<(), Error> {
    let mut parts = line.split(|&b| b == b':');
    let key = match parts.next() {
        Some(key) => str::from_utf8(key).map_err(|_| Error::NotUtf8)?,
        None => return Ok(()),
    };
    for part in parts {
        out.push(parse_sample(key, part)?);
    }
    Ok(())
}

/// Decode one `VALUE '|' TYPECODE ['@' RATE] ['|' STRINGVAL]` field into a
/// sample for `key`.
///
/// # Errors
///
/// Returns a field-level [`Error`] when any token of the field is
/// malformed; the caller is expected to abandon the rest of the line.
pub fn parse_sample(key: &str, field: &[u8]) -> Result<Sample, Error> {
    let mut pieces = field.splitn(3, |&b| b == b'|');
    let value_part = pieces.next().unwrap_or_default();
    let type_part = pieces.next().ok_or(Error::MissingSeparator)?;
    let string_part = pieces.next();

    let value: f64 = str::from_utf8(value_part)
        .map_err(|_| Error::NotUtf8)?
        .parse()
        .map_err(|_| Error::BadValue)?;

    let (code, sample_rate) = match type_part.iter().position(|&b| b == b'@') {
        Some(at) => (&type_part[..at], parse_rate(&type_part[at + 1..])?),
        None => (type_part, 1.0),
    };

    let kind = match code.first() {
        Some(b'c') => Kind::Counter,
        Some(b'm') => Kind::Timer,
        Some(b's') => Kind::Str(unescape(string_part.unwrap_or_default())?),
        Some(b'g') => Kind::Gauge {
            replace: value_part.first().is_some_and(u8::is_ascii_digit),
        },
        _ => return Err(Error::UnknownTypeCode),
    };

    Ok(Sample {
        key: key.to_owned(),
        value,
        sample_rate,
        kind,
    })
}

fn parse_rate(token: &[u8]) -> Result<f64, Error> {
    let rate: f64 = str::from_utf8(token)
        .map_err(|_| Error::NotUtf8)?
        .parse()
        .map_err(|_| Error::BadRate)?;
    if rate.is_finite() && rate > 0.0 {
        Ok(rate)
    } else {
        Err(Error::BadRate)
    }
}

/// Decode the statgram escape alphabet: `\n` is a newline, `\&` a pipe,
/// `\;` a colon, `\\` a backslash. Any other escape passes through
/// untouched, backslash included.
fn unescape(raw: &[u8]) -> Result<String, Error> {
    let mut decoded = Vec::with_capacity(raw.len());
    let mut bytes = raw.iter().copied();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            decoded.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'n') => decoded.push(b'\n'),
            Some(b'&') => decoded.push(b'|'),
            Some(b';') => decoded.push(b':'),
            Some(b'\\') => decoded.push(b'\\'),
            Some(other) => {
                decoded.push(b'\\');
                decoded.push(other);
            }
            None => decoded.push(b'\\'),
        }
    }
    String::from_utf8(decoded).map_err(|_| Error::NotUtf8)
}
