use std::collections::HashMap;
use std::env;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{GrowError, Result};
use crate::field::ValidField;
use crate::logger::LogConfig;

pub const ENV_LOG_LEVEL: &str = "GROW_LOG_LEVEL";
pub const ENV_LOG_DIR: &str = "GROW_LOG_DIR";
pub const ENV_PORT_MIN: &str = "GROW_PORT_MIN";
pub const ENV_PORT_MAX: &str = "GROW_PORT_MAX";
pub const ENV_RESTART_BACKOFF_MS: &str = "GROW_RESTART_BACKOFF_MS";

/// Bootstrap variables handed to every external proc.
pub const ENV_FIELD: &str = "FIELD";
pub const ENV_PROC_NAME: &str = "PROC_NAME";

pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 37000..=37900;
pub const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_millis(1000);

/// Process-wide runtime settings.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub log: LogConfig,
    pub port_range: RangeInclusive<u16>,
    pub restart_backoff: Duration,
    /// Kill the field on ctrl-c.
    pub handle_signals: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            port_range: DEFAULT_PORT_RANGE,
            restart_backoff: DEFAULT_RESTART_BACKOFF,
            handle_signals: true,
        }
    }
}

impl RuntimeConfig {
    /// Reads `.env` (when present) and then the `GROW_*` variables.
    pub fn from_env() -> Self {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("loaded .env from {}", path.display());
        }
        Self::from_vars(env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let mut config = RuntimeConfig::default();

        if let Some(level) = vars.get(ENV_LOG_LEVEL) {
            config.log.log_level = level.clone();
        }
        if let Some(dir) = vars.get(ENV_LOG_DIR) {
            config.log.log_dir = Some(PathBuf::from(dir));
        }

        let min = parse_var(&vars, ENV_PORT_MIN).unwrap_or(*DEFAULT_PORT_RANGE.start());
        let max = parse_var(&vars, ENV_PORT_MAX).unwrap_or(*DEFAULT_PORT_RANGE.end());
        if min <= max {
            config.port_range = min..=max;
        } else {
            warn!(min, max, "ignoring empty port range");
        }

        if let Some(ms) = parse_var::<u64>(&vars, ENV_RESTART_BACKOFF_MS) {
            config.restart_backoff = Duration::from_millis(ms);
        }
        config
    }

    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }

    pub fn without_signals(mut self) -> Self {
        self.handle_signals = false;
        self
    }
}

fn parse_var<T: std::str::FromStr>(vars: &HashMap<String, String>, key: &str) -> Option<T> {
    let raw = vars.get(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring unparsable {key}={raw}");
            None
        }
    }
}

/// What an external proc learns about itself at startup.
#[derive(Debug, Clone)]
pub struct BootstrapEnv {
    pub field: ValidField,
    pub proc_name: String,
}

impl BootstrapEnv {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let raw = vars
            .get(ENV_FIELD)
            .ok_or_else(|| GrowError::Config(format!("{ENV_FIELD} is not set")))?;
        let proc_name = vars
            .get(ENV_PROC_NAME)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| GrowError::Config(format!("{ENV_PROC_NAME} is not set")))?
            .clone();
        let field: ValidField = serde_json::from_str(raw)
            .map_err(|e| GrowError::Config(format!("{ENV_FIELD} is not a valid field: {e}")))?;
        if !field.procs.contains_key(&proc_name) {
            return Err(GrowError::Config(format!(
                "{ENV_PROC_NAME}={proc_name} is not a proc of this field"
            )));
        }
        Ok(Self { field, proc_name })
    }
}

/// Resolves a dotted path such as `db.hosts.0.name` inside a plant config.
pub fn lookup_path<'a>(config: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(config, |node, segment| match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}
