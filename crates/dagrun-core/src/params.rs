//! Run parameter resolution and expansion
//!
//! Parameters are a whitespace-separated list supplied either as DAG
//! defaults or as a per-run override string. An entry of the form
//! `NAME=VALUE` defines a named parameter; anything else is positional.
//! Expansion substitutes `$1`..`$n`, `$NAME`, and `${NAME}` references.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Resolved parameters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSet {
    /// Original parameter string, persisted with the run
    raw: String,

    positional: Vec<String>,

    named: BTreeMap<String, String>,
}

impl ParamSet {
    /// Resolve parameters from DAG defaults and an optional per-run override.
    ///
    /// An override replaces the defaults wholesale; it never merges.
    pub fn resolve(defaults: &[String], overrides: Option<&str>) -> Self {
        let raw = match overrides {
            Some(s) => s.to_string(),
            None => defaults.join(" "),
        };
        Self::parse(&raw)
    }

    /// Parse a raw parameter string.
    pub fn parse(raw: &str) -> Self {
        let mut positional = Vec::new();
        let mut named = BTreeMap::new();

        for token in raw.split_whitespace() {
            match token.split_once('=') {
                Some((name, value)) if !name.is_empty() && is_identifier(name) => {
                    named.insert(name.to_string(), value.to_string());
                }
                _ => positional.push(token.to_string()),
            }
        }

        Self {
            raw: raw.to_string(),
            positional,
            named,
        }
    }

    /// The original parameter string as supplied.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Positional parameter by 1-based index.
    pub fn positional(&self, index: usize) -> Option<&str> {
        if index == 0 {
            return None;
        }
        self.positional.get(index - 1).map(String::as_str)
    }

    /// Named parameter by name.
    pub fn named(&self, name: &str) -> Option<&str> {
        self.named.get(name).map(String::as_str)
    }

    /// Expand `$` references in the input against this parameter set.
    pub fn expand(&self, input: &str) -> String {
        self.expand_with(input, &BTreeMap::new())
    }

    /// Expand `$` references, with extra variables (captured step outputs)
    /// taking precedence over named parameters.
    pub fn expand_with(&self, input: &str, extra: &BTreeMap<String, String>) -> String {
        let mut out = String::with_capacity(input.len());
        let mut chars = input.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }

            let rest = &input[i + 1..];
            if let Some(stripped) = rest.strip_prefix('{') {
                if let Some(end) = stripped.find('}') {
                    let name = &stripped[..end];
                    out.push_str(&self.value_of(name, extra));
                    for _ in 0..name.chars().count() + 2 {
                        chars.next();
                    }
                    continue;
                }
            }

            let len = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .count();
            if len == 0 {
                out.push('$');
                continue;
            }
            let name = &rest[..len];
            out.push_str(&self.value_of(name, extra));
            for _ in 0..len {
                chars.next();
            }
        }

        out
    }

    /// Variables exported into a step's environment: named parameters plus
    /// positional ones as `1`..`n`.
    pub fn as_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .named
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (i, value) in self.positional.iter().enumerate() {
            env.push(((i + 1).to_string(), value.clone()));
        }
        env
    }

    fn value_of(&self, name: &str, extra: &BTreeMap<String, String>) -> String {
        if let Ok(index) = name.parse::<usize>() {
            return self.positional(index).unwrap_or_default().to_string();
        }
        if let Some(value) = extra.get(name) {
            return value.clone();
        }
        self.named(name).unwrap_or_default().to_string()
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
