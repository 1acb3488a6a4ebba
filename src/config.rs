use crate::error::ConfigError;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PROPERTIES_FILE: &str = "etc/group.properties";

const RESULTS_DIR: &str = "results.dir";
const PRINT_STATUS_INTERVAL: &str = "printStatusIntervalInSec";
const TEST_COUNT: &str = "testCount";
const TEST_INTERVAL: &str = "testIntervalInMsec";
const SESSION_POOL_SIZE: &str = "session.pool.size";

/// Flat, read-only key/value configuration namespace.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

impl Properties {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::MissingFile {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    /// Parses `.properties` text: `key=value` or `key: value`, `#`/`!`
    /// comments, `\` line continuations.
    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        let mut pending = String::new();
        for raw in text.lines() {
            let line = raw.trim();
            if pending.is_empty() && (line.is_empty() || line.starts_with('#') || line.starts_with('!')) {
                continue;
            }
            if let Some(stripped) = line.strip_suffix('\\') {
                pending.push_str(stripped);
                continue;
            }
            pending.push_str(line);
            let logical = std::mem::take(&mut pending);
            let split = logical.find(['=', ':']);
            let (key, value) = match split {
                Some(idx) => (&logical[..idx], &logical[idx + 1..]),
                None => (logical.as_str(), ""),
            };
            let key = key.trim();
            if !key.is_empty() {
                entries.insert(key.to_owned(), value.trim().to_owned());
            }
        }
        Properties { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Returns `Ok(None)` when the key is absent and an error when it is
    /// present but does not parse.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue {
                    key: key.to_owned(),
                    value: value.to_owned(),
                }),
        }
    }

    pub fn get_parsed_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        Ok(self.get_parsed(key)?.unwrap_or(default))
    }

    /// All entries whose key starts with `prefix`, with `prefix` removed.
    pub fn with_prefix(&self, prefix: &str) -> BTreeMap<String, String> {
        self.entries
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k[prefix.len()..].to_owned(), v.clone()))
            .collect()
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.entries
            .range(prefix.to_owned()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(prefix))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Properties {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// ⌈1.5 × available parallelism⌉, never below one.
pub fn default_thread_count() -> u32 {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1) as u32;
    (cpus * 3).div_ceil(2).max(1)
}

/// Process-wide run settings.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub results_dir: String,
    pub status_interval: Duration,
    pub test_count: u32,
    pub test_interval: Duration,
    pub session_pool_size: usize,
}

impl RunSettings {
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        let status_secs: u64 = props.get_parsed_or(PRINT_STATUS_INTERVAL, 10)?;
        let interval_ms: u64 = props.get_parsed_or(TEST_INTERVAL, 0)?;
        let test_count: u32 = props.get_parsed_or(TEST_COUNT, 1)?;
        let pool: usize = props.get_parsed_or(SESSION_POOL_SIZE, default_thread_count() as usize)?;
        Ok(RunSettings {
            results_dir: props.get_or(RESULTS_DIR, "results").to_owned(),
            status_interval: Duration::from_secs(status_secs.max(1)),
            test_count,
            test_interval: Duration::from_millis(interval_ms),
            session_pool_size: pool.max(1),
        })
    }
}
