//! Canonical per-hop call options.
//!
//! Options travel as an ordered list of `key[=value]` entries. Duplicate keys and
//! value-less flags are allowed. Conversion to process arguments, query strings
//! and wire strings happens here and nowhere else.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub struct CallOption {
    pub key: String,
    pub value: Option<String>,
}

impl CallOption {
    pub fn flag(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    pub fn pair(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// `-k` for one-character keys, `--key` otherwise. Keys already written
    /// as flags (`-l`, `--bytes`) pass through unchanged.
    fn arg_name(&self) -> String {
        if self.key.starts_with('-') {
            self.key.clone()
        } else if self.key.chars().count() == 1 {
            format!("-{}", self.key)
        } else {
            format!("--{}", self.key)
        }
    }
}

impl From<&str> for CallOption {
    fn from(s: &str) -> Self {
        match s.split_once('=') {
            Some((k, v)) => Self::pair(k, v),
            None => Self::flag(s),
        }
    }
}

impl From<String> for CallOption {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<CallOption> for String {
    fn from(opt: CallOption) -> Self {
        opt.to_string()
    }
}

impl fmt::Display for CallOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}={}", self.key, v),
            None => f.write_str(&self.key),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallOptions(Vec<CallOption>);

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, opt: CallOption) {
        self.0.push(opt);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallOption> {
        self.0.iter()
    }

    /// Parse `key=value` / `flag` tokens.
    pub fn parse<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            tokens
                .into_iter()
                .map(|t| CallOption::from(t.as_ref()))
                .collect(),
        )
    }

    /// Query pairs as decoded by an HTTP framework; an empty value becomes a flag.
    pub fn from_query_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| {
                    let v = v.into();
                    if v.is_empty() {
                        CallOption::flag(k)
                    } else {
                        CallOption::pair(k, v)
                    }
                })
                .collect(),
        )
    }

    /// Extra command line arguments for a one-shot process.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.0.len() * 2);
        for opt in &self.0 {
            args.push(opt.arg_name());
            if let Some(v) = &opt.value {
                args.push(v.clone());
            }
        }
        args
    }

    /// Append the options to `url` as query parameters.
    pub fn apply_to_url(&self, url: &mut reqwest::Url) {
        if self.0.is_empty() {
            return;
        }
        let mut query = url.query_pairs_mut();
        for opt in &self.0 {
            match &opt.value {
                Some(v) => query.append_pair(&opt.key, v),
                None => query.append_key_only(&opt.key),
            };
        }
    }
}

impl FromIterator<CallOption> for CallOptions {
    fn from_iter<T: IntoIterator<Item = CallOption>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a CallOptions {
    type Item = &'a CallOption;
    type IntoIter = std::slice::Iter<'a, CallOption>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
