//! Parsing of the Procfile and of the comma-separated option strings.
//!
//! Every auxiliary option (`--concurrency`, `--watch`, `--template`) shares the
//! same `key=value[,key=value...]` grammar. Malformed entries are dropped
//! rather than rejected; the number of dropped entries is kept for diagnostics.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::process::ProcessSpec;

/// Line separators recognised in the Procfile and in env files.
pub const LINE_SEPARATORS: [char; 4] = ['\n', '\r', '\u{2028}', '\u{2029}'];

/// An insertion-ordered map with string keys.
///
/// Inserting an existing key replaces its value in place, so the key keeps the
/// position of its first occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedMap<V> {
    entries: Vec<(String, V)>,
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<V> OrderedMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites `key`, keeping its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<V> FromIterator<(String, V)> for OrderedMap<V> {
    fn from_iter<I: IntoIterator<Item = (String, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

fn procfile_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z0-9_]+):\s?(.+)$").expect("valid procfile regex"))
}

fn inline_variable_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*=\S+").expect("valid inline regex"))
}

fn env_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid env key regex"))
}

/// Whether `key` is a plain environment variable name.
pub fn is_env_key(key: &str) -> bool {
    env_key_regex().is_match(key)
}

/// Parses Procfile contents into process specifications in manifest order.
///
/// Lines that are not `name: command` are skipped. A duplicate name keeps the
/// position of its first line and the command of its last.
pub fn parse_procfile(text: &str) -> Vec<ProcessSpec> {
    let mut procs = OrderedMap::new();
    for line in text.split(LINE_SEPARATORS) {
        if let Some(caps) = procfile_line_regex().captures(line) {
            procs.insert(&caps[1], caps[2].to_string());
        }
    }
    procs
        .iter()
        .map(|(name, command)| ProcessSpec::new(name, command))
        .collect()
}

/// Result of splitting a `key=value,...` option string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsvOptions {
    /// Well-formed pairs in the order they appeared.
    pub pairs: Vec<(String, String)>,
    /// Non-empty entries that did not contain exactly one `=`.
    pub dropped: usize,
}

pub fn parse_csv_options(spec: &str) -> CsvOptions {
    let mut options = CsvOptions::default();
    for entry in spec.split(',').filter(|entry| !entry.is_empty()) {
        let parts: Vec<&str> = entry.split('=').collect();
        if let [key, value] = parts.as_slice() {
            options.pairs.push((key.to_string(), value.to_string()));
        } else {
            options.dropped += 1;
        }
    }
    if options.dropped > 0 {
        tracing::debug!("[forewoman] dropped {} malformed entries from {:?}", options.dropped, spec);
    }
    options
}

/// Parses `name=count,...` into replica counts.
///
/// A count that is not a non-negative integer is an error.
pub fn parse_concurrency(spec: &str) -> Result<HashMap<String, usize>> {
    let mut counts = HashMap::new();
    for (name, value) in parse_csv_options(spec).pairs {
        let count = value
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid concurrency for {}: {:?}", name, value))?;
        counts.insert(name, count);
    }
    Ok(counts)
}

/// Parses `template=path,...`; relative paths are joined onto `base`.
pub fn parse_template_overrides(spec: &str, base: &Path) -> HashMap<String, PathBuf> {
    parse_csv_options(spec)
        .pairs
        .into_iter()
        .map(|(name, path)| (name, absolutize(base, &path)))
        .collect()
}

/// Parses `name=path,...`; relative paths are joined onto `base`.
pub fn parse_watch_spec(spec: &str, base: &Path) -> BTreeMap<String, PathBuf> {
    parse_csv_options(spec)
        .pairs
        .into_iter()
        .map(|(name, path)| (name, absolutize(base, &path)))
        .collect()
}

/// Extracts `KEY=value` tokens found anywhere in a command line.
pub fn parse_inline_variables(command: &str) -> OrderedMap<String> {
    let mut vars = OrderedMap::new();
    for token in inline_variable_regex().find_iter(command) {
        let parts: Vec<&str> = token.as_str().split('=').collect();
        if let [key, value] = parts.as_slice() {
            vars.insert(*key, value.to_string());
        }
    }
    vars
}

pub fn absolutize(base: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
