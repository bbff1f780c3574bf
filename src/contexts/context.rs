use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use log::warn;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::attribute_reference::Reference;
use crate::AttributeValue;

/// The type of entity a [Context] describes, such as "user", "device" or "org".
///
/// A valid kind is non-empty, is not "kind" or "multi", and consists only of ASCII letters,
/// digits, `.`, `_` and `-`.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct Kind(Cow<'static, str>);

impl Kind {
    /// The "user" kind, which is the default.
    pub fn user() -> Self {
        Self(Cow::Borrowed("user"))
    }

    pub(crate) fn multi() -> Self {
        Self(Cow::Borrowed("multi"))
    }

    /// Returns true for the "user" kind.
    pub fn is_user(&self) -> bool {
        self == "user"
    }

    /// Returns true for the kind of a multi-context.
    pub fn is_multi(&self) -> bool {
        self == "multi"
    }

    #[cfg(test)]
    pub(crate) fn from(s: &str) -> Self {
        Kind(Cow::Owned(s.to_owned()))
    }
}

impl AsRef<str> for Kind {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Ord for Kind {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_ref().cmp(other.as_ref())
    }
}

impl PartialOrd for Kind {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq<&str> for Kind {
    fn eq(&self, other: &&str) -> bool {
        self.as_ref() == *other
    }
}

impl PartialEq<str> for Kind {
    fn eq(&self, other: &str) -> bool {
        self.as_ref() == other
    }
}

impl Default for Kind {
    fn default() -> Self {
        Kind::user()
    }
}

impl TryFrom<&str> for Kind {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "" => Err("context kind cannot be empty".into()),
            "kind" => Err("context kind cannot be 'kind'".into()),
            "multi" => Err("context kind cannot be 'multi'".into()),
            "user" => Ok(Kind::user()),
            k if !k
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_')) =>
            {
                Err(format!("context kind '{}' contains disallowed characters", k))
            }
            k => Ok(Kind(Cow::Owned(k.to_owned()))),
        }
    }
}

impl TryFrom<String> for Kind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Kind::try_from(value.as_str())
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl Serialize for Kind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_ref())
    }
}

impl<'de> Deserialize<'de> for Kind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Kind::try_from(s).map_err(D::Error::custom)
    }
}

/// The entity a flag is evaluated for: a single kind with a key and attributes, or a
/// multi-context holding several single contexts of distinct kinds.
///
/// Contexts are immutable; build them with [crate::ContextBuilder] or
/// [crate::MultiContextBuilder].
#[derive(Clone, Debug, PartialEq)]
pub struct Context {
    pub(super) kind: Kind,
    // Only present for a multi-context, sorted by kind.
    pub(super) contexts: Option<Vec<Context>>,
    pub(super) name: Option<String>,
    pub(super) anonymous: bool,
    pub(super) canonical_key: String,
    pub(super) attributes: HashMap<String, AttributeValue>,
    // Empty for a multi-context.
    pub(super) key: String,
}

impl Context {
    /// Returns true if the context is a multi-context.
    pub fn is_multi(&self) -> bool {
        self.kind.is_multi()
    }

    /// Resolve `reference` against this context's attributes.
    ///
    /// Single contexts expose the built-ins "kind", "key", "name" and "anonymous" plus any
    /// custom attribute; path references descend into object values. A multi-context only
    /// exposes "kind"; use [Context::as_kind] to reach the individual contexts.
    pub fn get_value(&self, reference: &Reference) -> Option<AttributeValue> {
        let first = reference.component(0)?;

        if self.is_multi() {
            if reference.depth() == 1 && first == "kind" {
                return Some(AttributeValue::String(self.kind.to_string()));
            }
            warn!("multi-contexts only support retrieving the 'kind' attribute");
            return None;
        }

        let mut value = self.top_level_value(first)?;
        for depth in 1..reference.depth() {
            let name = reference.component(depth)?;
            value = match value {
                AttributeValue::Object(mut map) => map.remove(name)?,
                _ => return None,
            };
        }
        Some(value)
    }

    fn top_level_value(&self, name: &str) -> Option<AttributeValue> {
        match name {
            "kind" => Some(AttributeValue::String(self.kind.to_string())),
            "key" => Some(AttributeValue::String(self.key.clone())),
            "name" => self.name.clone().map(AttributeValue::String),
            "anonymous" => Some(AttributeValue::Bool(self.anonymous)),
            _ => self.attributes.get(name).cloned(),
        }
    }

    /// The context key. Empty for a multi-context.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// A string that uniquely identifies every (kind, key) pair in the context.
    ///
    /// This is the bare key for a single "user" context, `kind:key` for other single contexts,
    /// and the `:`-joined `kind:key` pairs of every member for a multi-context.
    pub fn canonical_key(&self) -> &str {
        &self.canonical_key
    }

    /// The kind; "multi" for a multi-context.
    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// The single context of the given kind, if present.
    pub fn as_kind(&self, kind: &Kind) -> Option<&Context> {
        match &self.contexts {
            Some(contexts) => contexts.iter().find(|c| c.kind() == kind),
            None => (self.kind == *kind).then_some(self),
        }
    }

    /// All kinds represented in this context.
    pub fn kinds(&self) -> Vec<&Kind> {
        match &self.contexts {
            Some(contexts) => contexts.iter().map(Context::kind).collect(),
            None => vec![self.kind()],
        }
    }

    /// A map of every (kind, key) pair in this context.
    pub fn context_keys(&self) -> HashMap<&Kind, &str> {
        match &self.contexts {
            Some(contexts) => contexts.iter().map(|c| (c.kind(), c.key())).collect(),
            None => maplit::hashmap! { self.kind() => self.key() },
        }
    }
}
