//! Outbound requests.
//!
//! A [`Request`] is a command name, an ordered parameter map, and an
//! ordered set of bare flags. Values are stored unescaped; escaping happens
//! in the codec when the request is written.

use indexmap::{IndexMap, IndexSet};

/// One ServerQuery command, immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    command: String,
    params: IndexMap<String, String>,
    flags: IndexSet<String>,
}

impl Request {
    /// A request with no parameters or flags.
    pub fn new(command: impl Into<String>) -> Self {
        Self::builder(command).build()
    }

    /// Start building a request for `command`.
    ///
    /// # Panics
    ///
    /// Panics if `command` is empty or contains whitespace.
    pub fn builder(command: impl Into<String>) -> RequestBuilder {
        let command = command.into();
        assert!(
            !command.is_empty() && !command.chars().any(char::is_whitespace),
            "invalid command name: {command:?}"
        );
        RequestBuilder {
            request: Self {
                command,
                params: IndexMap::new(),
                flags: IndexSet::new(),
            },
        }
    }

    /// Command name.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Parameters in insertion order.
    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Value of a single parameter.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Flags in insertion order, as given to the builder.
    pub fn flags(&self) -> impl Iterator<Item = &str> {
        self.flags.iter().map(String::as_str)
    }

    /// Whether the request carries `flag`.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }
}

/// Builder for [`Request`].
#[derive(Debug)]
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    /// Set a parameter. Setting an existing key replaces its value and keeps
    /// its original position.
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        let _ = self.request.params.insert(key.into(), value.to_string());
        self
    }

    /// Set a parameter only when `value` is `Some`.
    pub fn param_opt(self, key: impl Into<String>, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.param(key, value),
            None => self,
        }
    }

    /// Add a bare flag such as `uid` (sent as `-uid`).
    pub fn flag(mut self, flag: impl Into<String>) -> Self {
        let _ = self.request.flags.insert(flag.into());
        self
    }

    /// Finish the request.
    pub fn build(self) -> Request {
        self.request
    }
}
