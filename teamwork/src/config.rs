use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Kind of worker pool backing a team.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TeamKind {
    /// Executes jobs inline on the assigning thread.
    Passive,
    /// A single dedicated worker thread.
    OnePerson,
    /// A new thread per job, bounded by `max_workers`.
    WorkerPerJob { max_workers: usize },
    /// The tokio blocking pool, bounded by `max_threads` jobs in flight.
    Executor { max_threads: usize },
    /// A fixed set of threads; jobs are pinned by affinity key.
    Affinity { workers: usize },
}

/// Configuration of one team.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TeamConfig {
    /// Unique team name.
    pub name: String,
    #[serde(flatten)]
    pub kind: TeamKind,
    /// Bound of each worker queue, for queue-backed teams.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    1024
}

impl TeamConfig {
    pub fn new(name: impl Into<String>, kind: TeamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            queue_capacity: default_queue_capacity(),
        }
    }

    pub fn passive(name: impl Into<String>) -> Self {
        Self::new(name, TeamKind::Passive)
    }

    pub fn one_person(name: impl Into<String>) -> Self {
        Self::new(name, TeamKind::OnePerson)
    }

    pub fn worker_per_job(name: impl Into<String>, max_workers: usize) -> Self {
        Self::new(name, TeamKind::WorkerPerJob { max_workers })
    }

    pub fn executor(name: impl Into<String>, max_threads: usize) -> Self {
        Self::new(name, TeamKind::Executor { max_threads })
    }

    pub fn affinity(name: impl Into<String>, workers: usize) -> Self {
        Self::new(name, TeamKind::Affinity { workers })
    }

    /// Set the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

/// A declared dependency of a managed object.
///
/// The position in [`ManagedObjectConfig::dependencies`] is the dependency
/// index.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DependencyConfig {
    /// Key the dependent object uses to look the dependency up.
    pub key: String,
    /// Name of the managed object satisfying the dependency.
    pub managed_object: String,
}

/// Configuration of one managed object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManagedObjectConfig {
    /// Unique managed object name.
    pub name: String,
    /// Team running jobs that use this object, when a task does not name one.
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<DependencyConfig>,
    /// Maximum time spent sourcing or in an asynchronous operation.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ManagedObjectConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            team: None,
            dependencies: Vec::new(),
            timeout_ms: None,
        }
    }

    /// Set the default team.
    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    /// Declare a dependency under `key` on another managed object.
    pub fn with_dependency(
        mut self,
        key: impl Into<String>,
        managed_object: impl Into<String>,
    ) -> Self {
        self.dependencies.push(DependencyConfig {
            key: key.into(),
            managed_object: managed_object.into(),
        });
        self
    }

    /// Set the timeout in milliseconds.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Tuning of the office manager loops.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OfficeManagerConfig {
    /// Interval between timeout scans, in milliseconds.
    pub monitor_interval_ms: u64,
    /// Delay before retrying an overloaded team, in milliseconds.
    pub resubmit_backoff_ms: u64,
    /// Attempts before a resubmission is escalated as overloaded.
    pub resubmit_attempts: u32,
}

impl Default for OfficeManagerConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: 100,
            resubmit_backoff_ms: 10,
            resubmit_attempts: 50,
        }
    }
}

impl OfficeManagerConfig {
    /// Set the monitor interval.
    pub fn with_monitor_interval(mut self, ms: u64) -> Self {
        self.monitor_interval_ms = ms;
        self
    }

    /// Set the resubmission backoff.
    pub fn with_resubmit_backoff(mut self, ms: u64) -> Self {
        self.resubmit_backoff_ms = ms;
        self
    }

    /// Set the resubmission attempts.
    pub fn with_resubmit_attempts(mut self, attempts: u32) -> Self {
        self.resubmit_attempts = attempts;
        self
    }
}

/// Compiled configuration of an office.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OfficeConfig {
    pub name: String,
    #[serde(default)]
    pub teams: Vec<TeamConfig>,
    #[serde(default)]
    pub managed_objects: Vec<ManagedObjectConfig>,
    #[serde(default)]
    pub manager: OfficeManagerConfig,
}

impl OfficeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Add a team.
    pub fn with_team(mut self, team: TeamConfig) -> Self {
        self.teams.push(team);
        self
    }

    /// Add a managed object.
    pub fn with_managed_object(mut self, managed_object: ManagedObjectConfig) -> Self {
        self.managed_objects.push(managed_object);
        self
    }

    /// Set the manager tuning.
    pub fn with_manager(mut self, manager: OfficeManagerConfig) -> Self {
        self.manager = manager;
        self
    }

    pub fn managed_object(&self, name: &str) -> Option<&ManagedObjectConfig> {
        self.managed_objects.iter().find(|mo| mo.name == name)
    }

    /// Check names, references and the dependency graph.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_with_teams(&[])
    }

    /// Like [`validate`](Self::validate), also accepting teams supplied as
    /// instances rather than configuration.
    pub fn validate_with_teams(&self, external_teams: &[&str]) -> Result<(), ConfigError> {
        let mut teams = HashSet::new();
        let names = self.teams.iter().map(|team| team.name.as_str());
        for team in names.chain(external_teams.iter().copied()) {
            if !teams.insert(team) {
                return Err(ConfigError::Duplicate {
                    kind: "team",
                    name: team.to_string(),
                });
            }
        }

        let mut objects = HashSet::new();
        for mo in &self.managed_objects {
            if !objects.insert(mo.name.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "managed object",
                    name: mo.name.clone(),
                });
            }
        }

        for mo in &self.managed_objects {
            if let Some(team) = &mo.team {
                if !teams.contains(team.as_str()) {
                    return Err(ConfigError::UnknownTeam(team.clone()));
                }
            }
            let mut keys = HashSet::new();
            for dependency in &mo.dependencies {
                if !objects.contains(dependency.managed_object.as_str()) {
                    return Err(ConfigError::UnknownDependency {
                        managed_object: mo.name.clone(),
                        target: dependency.managed_object.clone(),
                    });
                }
                if !keys.insert(dependency.key.as_str()) {
                    return Err(ConfigError::Duplicate {
                        kind: "dependency key",
                        name: format!("{}.{}", mo.name, dependency.key),
                    });
                }
            }
        }

        for mo in &self.managed_objects {
            self.dependency_order(std::slice::from_ref(&mo.name))?;
        }
        Ok(())
    }

    /// Transitive dependency closure of `roots`, dependencies first.
    pub fn dependency_order(&self, roots: &[String]) -> Result<Vec<String>, ConfigError> {
        let by_name: HashMap<&str, &ManagedObjectConfig> = self
            .managed_objects
            .iter()
            .map(|mo| (mo.name.as_str(), mo))
            .collect();

        let mut order = Vec::new();
        let mut done = HashSet::new();
        let mut visiting = HashSet::new();
        for root in roots {
            visit(root, &by_name, &mut visiting, &mut done, &mut order)?;
        }
        Ok(order)
    }
}

fn visit(
    name: &str,
    by_name: &HashMap<&str, &ManagedObjectConfig>,
    visiting: &mut HashSet<String>,
    done: &mut HashSet<String>,
    order: &mut Vec<String>,
) -> Result<(), ConfigError> {
    if done.contains(name) {
        return Ok(());
    }
    if !visiting.insert(name.to_string()) {
        return Err(ConfigError::DependencyCycle(name.to_string()));
    }
    let mo = by_name
        .get(name)
        .ok_or_else(|| ConfigError::UnknownManagedObject(name.to_string()))?;
    for dependency in &mo.dependencies {
        visit(&dependency.managed_object, by_name, visiting, done, order)?;
    }
    visiting.remove(name);
    done.insert(name.to_string());
    order.push(name.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layered() -> OfficeConfig {
        OfficeConfig::new("office")
            .with_team(TeamConfig::one_person("io"))
            .with_managed_object(ManagedObjectConfig::new("pool").with_team("io"))
            .with_managed_object(ManagedObjectConfig::new("cache"))
            .with_managed_object(
                ManagedObjectConfig::new("repository")
                    .with_dependency("pool", "pool")
                    .with_dependency("cache", "cache"),
            )
    }

    #[test]
    fn test_dependency_order_puts_dependencies_first() {
        let config = layered();
        config.validate().unwrap();

        let order = config.dependency_order(&["repository".to_string()]).unwrap();
        assert_eq!(order, vec!["pool", "cache", "repository"]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let config = OfficeConfig::new("office")
            .with_managed_object(ManagedObjectConfig::new("a").with_dependency("b", "b"))
            .with_managed_object(ManagedObjectConfig::new("b").with_dependency("a", "a"));

        assert!(matches!(
            config.validate(),
            Err(ConfigError::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_unknown_references_are_rejected() {
        let unknown_team = OfficeConfig::new("office")
            .with_managed_object(ManagedObjectConfig::new("a").with_team("missing"));
        assert!(matches!(
            unknown_team.validate(),
            Err(ConfigError::UnknownTeam(team)) if team == "missing"
        ));

        let unknown_target = OfficeConfig::new("office")
            .with_managed_object(ManagedObjectConfig::new("a").with_dependency("x", "ghost"));
        assert!(matches!(
            unknown_target.validate(),
            Err(ConfigError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let config = OfficeConfig::new("office")
            .with_team(TeamConfig::passive("t"))
            .with_team(TeamConfig::one_person("t"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Duplicate { kind: "team", .. })
        ));
    }

    #[test]
    fn test_parses_json_configuration() {
        let json = r#"{
            "name": "office",
            "teams": [
                { "name": "io", "kind": "one_person" },
                { "name": "cpu", "kind": "executor", "max_threads": 8, "queue_capacity": 16 },
                { "name": "pinned", "kind": "affinity", "workers": 2 }
            ],
            "managed_objects": [
                { "name": "socket", "team": "io", "timeout_ms": 250 },
                { "name": "session", "dependencies": [ { "key": "socket", "managed_object": "socket" } ] }
            ]
        }"#;

        let config = OfficeConfig::from_json(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.teams.len(), 3);
        assert_eq!(config.teams[0].queue_capacity, 1024);
        assert_eq!(config.teams[1].kind, TeamKind::Executor { max_threads: 8 });
        assert_eq!(config.teams[1].queue_capacity, 16);
        assert_eq!(
            config.managed_object("socket").unwrap().timeout(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.manager.monitor_interval_ms, 100);
    }

    #[test]
    fn test_invalid_json_reports_parse_error() {
        assert!(matches!(
            OfficeConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
