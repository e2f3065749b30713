//! The statgram wire format.
//!
//! A statgram is one UDP payload carrying a line-oriented batch of sampled
//! values. Each line names a key and provides one or more `:`-separated
//! fields for that key, and a line may instead be front-compressed against
//! the previous line to shave repeated key prefixes off the wire. This
//! crate owns the sample model and the parser; accumulation and reporting
//! live with the daemon that embeds it.

use std::fmt;

mod parse;

pub use parse::{parse_sample, Parser};

/// Hard cap on the byte length of a single statgram line. Front-compressed
/// lines that would expand past this are dropped on the floor.
pub const MAX_LINE_LEN: usize = 1024;

/// The payload half of a [`Sample`]: what kind of observation it is, plus
/// any data specific to that kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Kind {
    /// A monotonically accumulated count.
    Counter,
    /// One timing observation, in whatever unit the sender measures.
    Timer,
    /// A string-frequency observation. Carries the observed string with
    /// wire escapes already decoded.
    Str(String),
    /// A point-in-time level. `replace` distinguishes an absolute set
    /// (`w:120|g`) from a signed delta (`w:+120|g`, `w:-5|g`).
    Gauge {
        /// True when the reported value replaces the previous level.
        replace: bool,
    },
}

impl Kind {
    /// The wire type code for this kind.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Kind::Counter => "c",
            Kind::Timer => "ms",
            Kind::Str(_) => "s",
            Kind::Gauge { .. } => "g",
        }
    }
}

/// A single typed observation decoded from a statgram line.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// The metric key the observation applies to.
    pub key: String,
    /// The numeric value. For string samples this is the observation
    /// weight, conventionally 0 or 1.
    pub value: f64,
    /// The rate at which the sender sampled this metric, in `(0, 1]`.
    /// Receivers divide by this to recover an unbiased estimate.
    pub sample_rate: f64,
    /// What kind of observation this is.
    pub kind: Kind,
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}|{}", self.key, self.value, self.kind.code())?;
        if self.sample_rate != 1.0 {
            write!(f, "@{}", self.sample_rate)?;
        }
        Ok(())
    }
}

/// An ordered batch of samples decoded from one datagram.
pub type Statgram = Vec<Sample>;

/// Errors produced while decoding a single sample field. An error is
/// confined to the field that produced it: earlier fields on the line are
/// kept, later fields on the line are abandoned, and other lines in the
/// datagram are unaffected.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The field has no `|` separating value from type code.
    #[error("sample field is missing a '|' separator")]
    MissingSeparator,
    /// The type code does not start with one of `c`, `m`, `s`, `g`.
    #[error("unrecognized sample type code")]
    UnknownTypeCode,
    /// The value token failed to parse as a float.
    #[error("malformed sample value")]
    BadValue,
    /// The `@rate` annotation failed to parse, or was not positive.
    #[error("malformed sample rate")]
    BadRate,
    /// The field contains bytes that are not valid UTF-8.
    #[error("sample field is not valid utf-8")]
    NotUtf8,
}
