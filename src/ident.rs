//! Identifiers addressing stored values.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use log::warn;
use serde::{Deserialize, Serialize};

//------------ SegmentBuf ----------------------------------------------------

/// A single element of an identifier path.
///
/// A segment is a nonempty string that does not start or end with
/// whitespace and does not contain any instances of [`Identifier::SEPARATOR`].
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[repr(transparent)]
pub struct SegmentBuf(String);

impl SegmentBuf {
    /// Parses a segment from a string.
    ///
    /// # Errors
    /// If the string is empty, starts or ends with whitespace, or contains
    /// an [`Identifier::SEPARATOR`], a [`SegmentError`] variant is returned.
    pub fn parse(value: &str) -> Result<Self, SegmentError> {
        if value.is_empty() {
            Err(SegmentError::Empty)
        } else if value.starts_with(char::is_whitespace) || value.ends_with(char::is_whitespace) {
            Err(SegmentError::SurroundingWhitespace)
        } else if value.contains(Identifier::SEPARATOR) {
            Err(SegmentError::ContainsSeparator)
        } else {
            Ok(SegmentBuf(value.to_owned()))
        }
    }

    /// Parses a segment from a string, sanitizing it if necessary.
    ///
    /// Every string maps to some valid segment: separators are replaced
    /// with a plus, surrounding whitespace is trimmed, and an empty string
    /// becomes `EMPTY`. A warning is logged whenever the input had to be
    /// changed.
    pub fn parse_lossy(value: &str) -> Self {
        match Self::parse(value) {
            Ok(segment) => segment,
            Err(error) => {
                let sanitized = value.trim().replace(Identifier::SEPARATOR, "+");
                let nonempty = if sanitized.is_empty() {
                    "EMPTY".to_owned()
                } else {
                    sanitized
                };
                warn!("'{value}' is not a valid segment: {error}; using '{nonempty}' instead");
                SegmentBuf(nonempty)
            }
        }
    }

    /// Returns the encapsulated string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SegmentBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SegmentBuf {
    type Err = SegmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SegmentBuf {
    type Error = SegmentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SegmentBuf> for String {
    fn from(value: SegmentBuf) -> Self {
        value.0
    }
}

//------------ Identifier ----------------------------------------------------

/// The hierarchical key addressing a stored value.
///
/// An identifier consists of a path of zero or more [`SegmentBuf`]s and a
/// final id segment. Identifiers are totally ordered: paths are compared
/// element by element, a path that is a strict prefix of another orders
/// first, and ids break ties between equal paths. The derived `Ord` on the
/// field order below implements exactly that.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier {
    path: Vec<SegmentBuf>,
    id: SegmentBuf,
}

impl Identifier {
    /// Character separating segments in the string form.
    pub const SEPARATOR: char = '/';

    /// Creates an identifier from a path and an id.
    pub fn new(path: Vec<SegmentBuf>, id: SegmentBuf) -> Self {
        Identifier { path, id }
    }

    /// Creates an identifier with an empty path.
    pub fn global(id: SegmentBuf) -> Self {
        Identifier { path: Vec::new(), id }
    }

    /// Parses an identifier, sanitizing invalid segments.
    pub fn parse_lossy(s: &str) -> Self {
        let mut segments: Vec<SegmentBuf> = s
            .split(Self::SEPARATOR)
            .map(SegmentBuf::parse_lossy)
            .collect();
        // parse_lossy never yields an empty list: even "" maps to one
        // sanitized segment.
        let id = segments.pop().expect("split yields at least one element");
        Identifier { path: segments, id }
    }

    /// Returns the path of the identifier.
    pub fn path(&self) -> &[SegmentBuf] {
        &self.path
    }

    /// Returns the id of the identifier, without its path.
    pub fn id(&self) -> &SegmentBuf {
        &self.id
    }

    /// Returns whether the identifier's path starts with the given prefix.
    ///
    /// An empty prefix matches every identifier.
    pub fn path_starts_with(&self, prefix: &[SegmentBuf]) -> bool {
        self.path.len() >= prefix.len() && &self.path[..prefix.len()] == prefix
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for segment in &self.path {
            write!(f, "{}{}", segment, Self::SEPARATOR)?;
        }
        self.id.fmt(f)
    }
}

impl FromStr for Identifier {
    type Err = SegmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut segments: Vec<SegmentBuf> = s
            .split(Self::SEPARATOR)
            .map(SegmentBuf::parse)
            .collect::<Result<_, _>>()?;
        let id = segments.pop().ok_or(SegmentError::Empty)?;
        Ok(Identifier { path: segments, id })
    }
}

impl TryFrom<String> for Identifier {
    type Error = SegmentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.to_string()
    }
}

//------------ SegmentError --------------------------------------------------

/// Represents all ways parsing a string as a [`SegmentBuf`] can fail.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SegmentError {
    Empty,
    SurroundingWhitespace,
    ContainsSeparator,
}

impl Display for SegmentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentError::Empty => "segments must be nonempty",
            SegmentError::SurroundingWhitespace => "segments must not start or end with whitespace",
            SegmentError::ContainsSeparator => "segments must not contain separators",
        }
        .fmt(f)
    }
}

impl std::error::Error for SegmentError {}

//------------ Tests ---------------------------------------------------------
