use std::fmt::{self, Display};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug)]
enum ParseError {
    Empty,
    InvalidEscapeSequence,
    DoubleOrTrailingSlash,
}

impl Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let message = match self {
            ParseError::Empty => "reference cannot be empty",
            ParseError::InvalidEscapeSequence => "reference contains invalid escape sequence",
            ParseError::DoubleOrTrailingSlash => "reference contains double or trailing slash",
        };
        f.write_str(message)
    }
}

/// Identifies an attribute, or a value nested inside an attribute, of a [crate::Context].
///
/// A string that does not start with `/` names a top-level attribute literally, so `"a/b"` is
/// the attribute called `a/b`. A string starting with `/` is a path: `"/address/city"` is the
/// `city` property of the `address` object. Inside path components `~1` stands for `/` and `~0`
/// for `~`.
///
/// Invalid input still produces a `Reference` (so it can be reported and re-serialized), but
/// [Reference::is_valid] returns false and it resolves to nothing.
///
/// ```
/// # use flag_evaluation_engine::Reference;
/// assert_eq!(Reference::new("name").depth(), 1);
/// assert_eq!(Reference::new("/address/city").component(1), Some("city"));
/// assert_eq!(Reference::new("/a~1b").component(0), Some("a/b"));
/// assert!(!Reference::new("/a//b").is_valid());
/// ```
#[derive(Clone, Hash, PartialEq, Eq, Debug)]
pub struct Reference {
    input: String,
    parsed: Result<Path, ParseError>,
}

#[derive(Clone, Hash, PartialEq, Eq, Debug)]
enum Path {
    Literal,
    Components(Vec<String>),
}

impl Reference {
    /// Parse `value` into a reference. Always succeeds; see [Reference::is_valid].
    pub fn new<S: AsRef<str>>(value: S) -> Self {
        let input = value.as_ref().to_owned();
        let parsed = Self::parse(&input);
        Self { input, parsed }
    }

    fn parse(input: &str) -> Result<Path, ParseError> {
        match input.strip_prefix('/') {
            _ if input.is_empty() || input == "/" => Err(ParseError::Empty),
            None => Ok(Path::Literal),
            Some(path) => path
                .split('/')
                .map(|part| {
                    if part.is_empty() {
                        Err(ParseError::DoubleOrTrailingSlash)
                    } else {
                        unescape(part)
                    }
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Path::Components),
        }
    }

    /// Returns true if the reference parsed successfully.
    pub fn is_valid(&self) -> bool {
        self.parsed.is_ok()
    }

    /// A description of the parse failure, or an empty string for a valid reference.
    pub fn error(&self) -> String {
        match &self.parsed {
            Err(e) => e.to_string(),
            Ok(_) => String::new(),
        }
    }

    /// Number of path components; 1 for a literal name and 0 for an invalid reference.
    pub fn depth(&self) -> usize {
        match &self.parsed {
            Ok(Path::Literal) => 1,
            Ok(Path::Components(components)) => components.len(),
            Err(_) => 0,
        }
    }

    /// The path component at `index`, if there is one.
    pub fn component(&self, index: usize) -> Option<&str> {
        match &self.parsed {
            Ok(Path::Literal) if index == 0 => Some(&self.input),
            Ok(Path::Components(components)) => components.get(index).map(String::as_str),
            _ => None,
        }
    }

    /// True if the reference addresses the context's `kind`.
    pub(crate) fn is_kind(&self) -> bool {
        self.depth() == 1 && self.component(0) == Some("kind")
    }
}

fn unescape(part: &str) -> Result<String, ParseError> {
    if !part.contains('~') {
        return Ok(part.to_owned());
    }

    let mut out = String::with_capacity(part.len());
    let mut chars = part.chars();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('/'),
            _ => return Err(ParseError::InvalidEscapeSequence),
        }
    }
    Ok(out)
}

impl Default for Reference {
    /// An empty, invalid reference.
    fn default() -> Self {
        Reference::new("")
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.input)
    }
}

impl<S: AsRef<str>> From<S> for Reference {
    fn from(reference: S) -> Self {
        Reference::new(reference)
    }
}

impl Serialize for Reference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.input)
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Reference::new)
    }
}
