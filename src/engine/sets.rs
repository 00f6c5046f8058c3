use std::collections::{HashMap, HashSet};
use std::path::Path;

use super::rules::{BAD_WORDS_SET, WATCH_ACCOUNTS_SET};
use crate::errors::ConfigError;

/// Named string sets available to rules, loaded once at startup.
#[derive(Clone, Debug, Default)]
pub struct StaticSets {
    sets: HashMap<String, HashSet<String>>,
}

impl StaticSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every set the built-in rules read, all empty. Used when no sets file is
    /// configured.
    pub fn empty_builtin() -> Self {
        Self::new()
            .with_set(BAD_WORDS_SET, Vec::<String>::new())
            .with_set(WATCH_ACCOUNTS_SET, Vec::<String>::new())
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let load_failed = |details: String| ConfigError::StaticSetsLoadFailed {
            path: path.display().to_string(),
            details,
        };
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| load_failed(e.to_string()))?;
        Self::from_json(&data).map_err(|e| load_failed(e.to_string()))
    }

    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: HashMap<String, Vec<String>> = serde_json::from_slice(data)?;
        Ok(Self {
            sets: raw
                .into_iter()
                .map(|(name, values)| {
                    let values = values.into_iter().map(|v| v.to_lowercase()).collect();
                    (name, values)
                })
                .collect(),
        })
    }

    pub fn with_set<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.sets.insert(
            name.to_string(),
            values
                .into_iter()
                .map(|v| v.as_ref().to_lowercase())
                .collect(),
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&HashSet<String>> {
        self.sets.get(name)
    }

    /// Case-insensitive membership test. Unknown sets contain nothing.
    pub fn contains(&self, name: &str, value: &str) -> bool {
        self.sets
            .get(name)
            .is_some_and(|set| set.contains(&value.to_lowercase()))
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}
