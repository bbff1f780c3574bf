use std::collections::HashMap;

use itertools::Itertools;
use log::warn;

use super::context::{Context, Kind};
use crate::AttributeValue;

const DEFAULT_MULTI_BUILDER_CAPACITY: usize = 3;

/// Builds a single-kind [Context].
///
/// Unless changed, the kind is "user", the context is not anonymous, and only the key passed to
/// [ContextBuilder::new] is set.
pub struct ContextBuilder {
    kind: String,
    key: String,
    name: Option<String>,
    anonymous: bool,
    attributes: HashMap<String, AttributeValue>,
}

impl ContextBuilder {
    /// Create a builder for a context with the given key.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            kind: "user".to_owned(),
            key: key.into(),
            name: None,
            anonymous: false,
            attributes: HashMap::new(),
        }
    }

    /// Set the kind. Validity is checked by [ContextBuilder::build].
    pub fn kind(&mut self, kind: impl Into<String>) -> &mut Self {
        self.kind = kind.into();
        self
    }

    /// Set the key, which cannot be empty.
    pub fn key(&mut self, key: impl Into<String>) -> &mut Self {
        self.key = key.into();
        self
    }

    /// Set the "name" attribute.
    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    /// Set the "anonymous" attribute.
    pub fn anonymous(&mut self, value: bool) -> &mut Self {
        self.anonymous = value;
        self
    }

    /// Set a string attribute.
    pub fn set_string(&mut self, attribute_name: &str, value: impl Into<String>) -> &mut Self {
        self.set_value(attribute_name, AttributeValue::String(value.into()))
    }

    /// Set a numeric attribute.
    pub fn set_float(&mut self, attribute_name: &str, value: f64) -> &mut Self {
        self.set_value(attribute_name, AttributeValue::Number(value))
    }

    /// Set a boolean attribute.
    pub fn set_bool(&mut self, attribute_name: &str, value: bool) -> &mut Self {
        self.set_value(attribute_name, AttributeValue::Bool(value))
    }

    /// Set any attribute, ignoring values that violate the rules of [ContextBuilder::try_set_value].
    pub fn set_value(&mut self, attribute_name: &str, value: AttributeValue) -> &mut Self {
        let _ = self.try_set_value(attribute_name, value);
        self
    }

    /// Set any attribute, returning false if the value was rejected.
    ///
    /// "kind", "key" and "name" must be strings and "anonymous" must be a boolean; the name
    /// "_meta" and the empty name are reserved. Setting a custom attribute to null removes it.
    pub fn try_set_value(&mut self, attribute_name: &str, value: AttributeValue) -> bool {
        match (attribute_name, value) {
            ("", _) => {
                warn!("ignoring attribute with empty name");
                false
            }
            ("_meta", _) => false,
            ("kind", AttributeValue::String(s)) => {
                self.kind = s;
                true
            }
            ("key", AttributeValue::String(s)) => {
                self.key = s;
                true
            }
            ("name", AttributeValue::String(s)) => {
                self.name = Some(s);
                true
            }
            ("name", AttributeValue::Null) => {
                self.name = None;
                true
            }
            ("anonymous", AttributeValue::Bool(b)) => {
                self.anonymous = b;
                true
            }
            ("kind" | "key" | "name" | "anonymous", _) => false,
            (_, AttributeValue::Null) => {
                self.attributes.remove(attribute_name);
                true
            }
            (_, value) => {
                self.attributes.insert(attribute_name.to_owned(), value);
                true
            }
        }
    }

    /// Build the context, failing if the kind is invalid or the key is empty.
    pub fn build(&self) -> Result<Context, String> {
        let kind = Kind::try_from(self.kind.as_str())?;

        if self.key.is_empty() {
            return Err("key cannot be empty".into());
        }

        Ok(Context {
            canonical_key: canonical_key_for_kind(&kind, &self.key, true),
            kind,
            contexts: None,
            name: self.name.clone(),
            anonymous: self.anonymous,
            attributes: self.attributes.clone(),
            key: self.key.clone(),
        })
    }
}

fn canonical_key_for_kind(kind: &Kind, key: &str, omit_user_kind: bool) -> String {
    if omit_user_kind && kind.is_user() {
        return key.to_owned();
    }
    format!("{}:{}", kind, key.replace('%', "%25").replace(':', "%3A"))
}

/// Builds a multi-context out of several single contexts of distinct kinds.
pub struct MultiContextBuilder {
    contexts: Vec<Context>,
}

impl MultiContextBuilder {
    /// Create an empty builder. At least one context must be added before building.
    pub fn new() -> Self {
        Self {
            contexts: Vec::with_capacity(DEFAULT_MULTI_BUILDER_CAPACITY),
        }
    }

    /// Add a context. Adding a multi-context adds each of its members.
    pub fn add_context(&mut self, context: Context) -> &mut Self {
        match context.contexts {
            Some(members) => self.contexts.extend(members),
            None => self.contexts.push(context),
        }
        self
    }

    /// Build the multi-context. A single added context is returned as-is; duplicate kinds are
    /// an error.
    pub fn build(&self) -> Result<Context, String> {
        match self.contexts.len() {
            0 => return Err("multi-context must contain at least one context".into()),
            1 => return Ok(self.contexts[0].clone()),
            _ => (),
        }

        let contexts: Vec<Context> = self
            .contexts
            .iter()
            .cloned()
            .sorted_by(|a, b| a.kind.cmp(&b.kind))
            .collect();

        if contexts.iter().tuple_windows().any(|(a, b)| a.kind == b.kind) {
            return Err("multi-context cannot contain the same kind more than once".into());
        }

        let canonical_key = contexts
            .iter()
            .map(|c| canonical_key_for_kind(c.kind(), c.key(), false))
            .join(":");

        Ok(Context {
            kind: Kind::multi(),
            contexts: Some(contexts),
            name: None,
            anonymous: false,
            canonical_key,
            attributes: HashMap::new(),
            key: String::new(),
        })
    }
}

impl Default for MultiContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
