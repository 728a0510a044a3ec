use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::ops::RangeInclusive;
use std::path::PathBuf;

use grow_wire::MAIN_PROC;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::{GrowError, Result};

/// Attempts made to find a free local port.
pub const URL_ATTEMPTS: usize = 50;

/// Named method set a plant declares. Only used to reject calls to
/// undeclared methods before they leave the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub name: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

impl Contract {
    pub fn new(name: impl Into<String>, methods: &[&str]) -> Self {
        Self {
            name: name.into(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlantDef {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contracts: Vec<Contract>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub http: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proc: Option<String>,
}

impl PlantDef {
    pub fn in_proc(proc: impl Into<String>) -> Self {
        Self {
            proc: Some(proc.into()),
            ..Default::default()
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_contract(mut self, contract: Contract) -> Self {
        self.contracts.push(contract);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub restart_on_error: bool,
}

impl ProcDef {
    pub fn external<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: Some(cmd.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn restart_on_error(mut self) -> Self {
        self.restart_on_error = true;
        self
    }
}

/// User-authored description of a deployment. Turned into a [`ValidField`]
/// before anything is spawned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub communication_secret: Option<String>,
    #[serde(default)]
    pub plants: BTreeMap<String, PlantDef>,
    #[serde(default)]
    pub procs: BTreeMap<String, ProcDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidPlantDef {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contracts: Vec<Contract>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub http: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub proc: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidProcDef {
    pub cwd: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    pub url: String,
    #[serde(default)]
    pub restart_on_error: bool,
}

/// How a proc is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcKind {
    /// Runs on the orchestrator's own runtime.
    Main,
    /// Dedicated thread with its own runtime, linked by ports.
    Worker,
    /// Separate OS process reached over the HTTP bridge.
    External,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidField {
    pub communication_secret: String,
    pub plants: BTreeMap<String, ValidPlantDef>,
    pub procs: BTreeMap<String, ValidProcDef>,
}

impl Field {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plant(mut self, name: impl Into<String>, def: PlantDef) -> Self {
        self.plants.insert(name.into(), def);
        self
    }

    pub fn proc(mut self, name: impl Into<String>, def: ProcDef) -> Self {
        self.procs.insert(name.into(), def);
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.communication_secret = Some(secret.into());
        self
    }

    /// Fills in every default and checks the result.
    ///
    /// Plants without a proc get their own proc named after them, procs
    /// without a url get a free local one, and the `main` proc always exists
    /// because its url is where the orchestrator's bridge listens.
    pub fn validate(self, config: &RuntimeConfig) -> Result<ValidField> {
        let cwd = std::env::current_dir()?;
        let mut used_urls = BTreeSet::new();

        let mut plants = BTreeMap::new();
        for (name, def) in self.plants {
            if name.is_empty() || name.starts_with('@') {
                return Err(GrowError::Validation(format!("`{name}` is not a valid plant name")));
            }
            let proc = def.proc.unwrap_or_else(|| name.clone());
            plants.insert(
                name,
                ValidPlantDef {
                    contracts: def.contracts,
                    config: match def.config {
                        Value::Null => Value::Object(Map::new()),
                        config => config,
                    },
                    http: def.http,
                    file_path: def.file_path,
                    proc,
                },
            );
        }

        let mut names: BTreeSet<String> = self.procs.keys().cloned().collect();
        names.extend(plants.values().map(|p| p.proc.clone()));
        names.insert(MAIN_PROC.to_string());

        let mut defined = self.procs;
        let mut procs = BTreeMap::new();
        for name in names {
            let def = defined.remove(&name).unwrap_or_default();
            if name == MAIN_PROC && def.cmd.is_some() {
                return Err(GrowError::Validation("the main proc cannot run a command".into()));
            }
            if def.cmd.as_ref().is_some_and(|cmd| cmd.is_empty()) {
                return Err(GrowError::Validation(format!("proc `{name}` has an empty cmd")));
            }
            let url = match def.url {
                Some(url) => {
                    Url::parse(&url)
                        .map_err(|e| GrowError::Validation(format!("proc `{name}`: {e}")))?;
                    url
                }
                None => generate_local_url(&config.port_range, &used_urls)?,
            };
            used_urls.insert(url.clone());
            procs.insert(
                name,
                ValidProcDef {
                    cwd: def.cwd.unwrap_or_else(|| cwd.clone()),
                    cmd: def.cmd,
                    url,
                    restart_on_error: def.restart_on_error,
                },
            );
        }

        let communication_secret = self
            .communication_secret
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(ValidField {
            communication_secret,
            plants,
            procs,
        })
    }
}

impl ValidField {
    pub fn proc_of(&self, plant: &str) -> Option<&str> {
        self.plants.get(plant).map(|p| p.proc.as_str())
    }

    pub fn kind_of(&self, proc: &str) -> Option<ProcKind> {
        let def = self.procs.get(proc)?;
        Some(if def.cmd.is_some() {
            ProcKind::External
        } else if proc == MAIN_PROC {
            ProcKind::Main
        } else {
            ProcKind::Worker
        })
    }

    pub fn is_external(&self, proc: &str) -> bool {
        self.kind_of(proc) == Some(ProcKind::External)
    }

    pub fn has_external_procs(&self) -> bool {
        self.procs.values().any(|p| p.cmd.is_some())
    }

    /// Procs that host at least one plant. Procs without plants are never
    /// spawned.
    pub fn active_procs(&self) -> BTreeSet<&str> {
        self.plants.values().map(|p| p.proc.as_str()).collect()
    }

    /// Active procs reachable through ports (main and workers).
    pub fn channel_procs(&self) -> Vec<String> {
        self.active_procs()
            .into_iter()
            .filter(|p| !self.is_external(p))
            .map(str::to_string)
            .collect()
    }

    pub fn url_of(&self, proc: &str) -> Option<&str> {
        self.procs.get(proc).map(|p| p.url.as_str())
    }

    pub fn main_url(&self) -> Option<&str> {
        self.url_of(MAIN_PROC)
    }

    /// The field as it is handed to procs: contracts are orchestrator-only.
    pub fn transferable(&self) -> ValidField {
        let mut field = self.clone();
        for plant in field.plants.values_mut() {
            plant.contracts.clear();
        }
        field
    }

    /// Per-plant configs of the plants hosted by `proc`.
    pub fn config_for(&self, proc: &str) -> HashMap<String, Value> {
        self.plants
            .iter()
            .filter(|(_, def)| def.proc == proc)
            .map(|(name, def)| (name.clone(), def.config.clone()))
            .collect()
    }

    /// Rejects methods missing from every contract of a plant that declares
    /// contracts.
    pub fn check_contract(&self, plant: &str, method: &str) -> Result<()> {
        let Some(def) = self.plants.get(plant) else {
            return Ok(());
        };
        if def.contracts.is_empty() || def.contracts.iter().any(|c| c.methods.iter().any(|m| m == method)) {
            return Ok(());
        }
        Err(GrowError::MethodNotFound {
            plant: plant.to_string(),
            method: method.to_string(),
        })
    }
}

/// Picks a free port on the loopback interface.
pub fn generate_local_url(range: &RangeInclusive<u16>, taken: &BTreeSet<String>) -> Result<String> {
    let mut rng = rand::rng();
    for _ in 0..URL_ATTEMPTS {
        let port = rng.random_range(range.clone());
        let url = format!("http://127.0.0.1:{port}");
        if taken.contains(&url) {
            continue;
        }
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        if TcpListener::bind(addr).is_ok() {
            debug!(%url, "picked local url");
            return Ok(url);
        }
    }
    Err(GrowError::Config(format!(
        "no available port in {}..={} after {URL_ATTEMPTS} attempts",
        range.start(),
        range.end()
    )))
}

/// Socket address a bridge listening on `url` should bind to.
pub fn bind_addr(url: &str) -> Result<SocketAddr> {
    let parsed = Url::parse(url).map_err(|e| GrowError::Validation(format!("{url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| GrowError::Validation(format!("{url} has no host")))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| GrowError::Validation(format!("{url} has no port")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let ip: IpAddr = match host {
        "localhost" => [127, 0, 0, 1].into(),
        other => other
            .parse()
            .map_err(|_| GrowError::Validation(format!("{url}: bridge hosts must be IP addresses")))?,
    };
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validate(field: Field) -> ValidField {
        field.validate(&RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn plants_default_to_their_own_proc() {
        let field = validate(Field::new().plant("Access", PlantDef::default()));
        assert_eq!(field.proc_of("Access"), Some("Access"));
        assert_eq!(field.plants["Access"].config, serde_json::json!({}));
        assert_eq!(field.config_for("Access")["Access"], serde_json::json!({}));
        assert_eq!(field.kind_of("Access"), Some(ProcKind::Worker));
        assert!(field.procs.contains_key(MAIN_PROC));
        assert_eq!(field.kind_of(MAIN_PROC), Some(ProcKind::Main));
    }

    #[test]
    fn procs_get_cwd_url_and_secret() {
        let field = validate(
            Field::new()
                .plant("Hello", PlantDef::in_proc("ext"))
                .proc("ext", ProcDef::external(["./hello"])),
        );
        let ext = &field.procs["ext"];
        assert_eq!(ext.cwd, std::env::current_dir().unwrap());
        assert!(ext.url.starts_with("http://127.0.0.1:"));
        assert_ne!(ext.url, field.procs[MAIN_PROC].url);
        assert!(!field.communication_secret.is_empty());
        assert!(field.is_external("ext"));
        assert!(field.has_external_procs());
    }

    #[test]
    fn explicit_values_are_kept() {
        let field = validate(
            Field::new()
                .with_secret("s3cret")
                .plant("A", PlantDef::in_proc(MAIN_PROC))
                .proc(
                    MAIN_PROC,
                    ProcDef {
                        url: Some("http://127.0.0.1:39999".into()),
                        ..Default::default()
                    },
                ),
        );
        assert_eq!(field.communication_secret, "s3cret");
        assert_eq!(field.main_url(), Some("http://127.0.0.1:39999"));
        assert_eq!(field.channel_procs(), vec![MAIN_PROC.to_string()]);
    }

    #[test]
    fn main_cannot_be_external() {
        let err = Field::new()
            .proc(MAIN_PROC, ProcDef::external(["x"]))
            .validate(&RuntimeConfig::default())
            .unwrap_err();
        assert!(matches!(err, GrowError::Validation(_)));
    }

    #[test]
    fn transferable_drops_contracts_only() {
        let field = validate(Field::new().plant(
            "Access",
            PlantDef::default()
                .with_config(json!({ "a": 1 }))
                .with_contract(Contract::new("AccessApi", &["listItems"])),
        ));
        let moved = field.transferable();
        assert!(moved.plants["Access"].contracts.is_empty());
        assert_eq!(moved.plants["Access"].config, json!({ "a": 1 }));
        assert!(field.check_contract("Access", "listItems").is_ok());
        assert!(field.check_contract("Access", "dropTable").is_err());
        assert!(moved.check_contract("Access", "dropTable").is_ok());
    }

    #[test]
    fn bind_addr_from_url() {
        let addr = bind_addr("http://127.0.0.1:37123").unwrap();
        assert_eq!(addr.port(), 37123);
        assert!(bind_addr("http://example.com:80").is_err());
    }
}
