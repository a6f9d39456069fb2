use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::config::OfficeConfig;
use crate::error::ConfigError;
use crate::events::InProcEventBus;
use crate::managed_object::{ManagedObjectMetaData, ManagedObjectSource};
use crate::manager::OfficeManager;
use crate::team::{Team, build_team};

use super::{EscalationHandler, LoggingEscalationHandler, Office, OfficeShared};

/// Builder for an [`Office`].
///
/// Every managed object in the configuration needs a source. Teams come from
/// the configuration, plus any instances added with `with_team`.
///
/// # Example
///
/// ```ignore
/// let office = Office::builder(config)
///     .with_source("db", |user: ManagedObjectUser| {
///         let _ = user.set_managed_object(Database::connect());
///     })
///     .build()?;
/// ```
pub struct OfficeBuilder {
    config: OfficeConfig,
    teams: Vec<Arc<dyn Team>>,
    sources: HashMap<String, Arc<dyn ManagedObjectSource>>,
    events: Option<Arc<InProcEventBus>>,
    escalation: Option<Arc<dyn EscalationHandler>>,
    runtime: Option<Handle>,
}

impl fmt::Debug for OfficeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sources: Vec<_> = self.sources.keys().collect();
        sources.sort();
        let teams: Vec<_> = self.teams.iter().map(|team| team.name()).collect();
        f.debug_struct("OfficeBuilder")
            .field("config", &self.config.name)
            .field("teams", &teams)
            .field("sources", &sources)
            .field("events_set", &self.events.is_some())
            .field("escalation_set", &self.escalation.is_some())
            .field("runtime_set", &self.runtime.is_some())
            .finish()
    }
}

impl OfficeBuilder {
    pub fn new(config: OfficeConfig) -> Self {
        Self {
            config,
            teams: Vec::new(),
            sources: HashMap::new(),
            events: None,
            escalation: None,
            runtime: None,
        }
    }

    /// Add a team instance not described by the configuration.
    pub fn with_team(mut self, team: Arc<dyn Team>) -> Self {
        self.teams.push(team);
        self
    }

    /// Bind the source of managed object `name`.
    pub fn with_source(mut self, name: impl Into<String>, source: impl ManagedObjectSource) -> Self {
        self.sources.insert(name.into(), Arc::new(source));
        self
    }

    /// Set the event bus.
    pub fn with_events(mut self, events: Arc<InProcEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the office-wide escalation handler.
    pub fn with_escalation_handler(mut self, handler: impl EscalationHandler) -> Self {
        self.escalation = Some(Arc::new(handler));
        self
    }

    /// Run the office manager on `runtime` instead of the current one.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Validate the configuration, start every team and the office manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, a managed object has
    /// no source, no tokio runtime is available, or a team fails to start.
    pub fn build(mut self) -> anyhow::Result<Office> {
        let external: Vec<&str> = self.teams.iter().map(|team| team.name()).collect();
        self.config.validate_with_teams(&external)?;

        for name in self.sources.keys() {
            if self.config.managed_object(name).is_none() {
                return Err(ConfigError::UnknownManagedObject(name.clone()).into());
            }
        }
        let mut metadata = HashMap::new();
        for managed_object in &self.config.managed_objects {
            let source = self
                .sources
                .remove(&managed_object.name)
                .ok_or_else(|| ConfigError::MissingSource(managed_object.name.clone()))?;
            metadata.insert(
                managed_object.name.clone(),
                Arc::new(ManagedObjectMetaData::new(managed_object, source)),
            );
        }

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .map_err(|err| anyhow::anyhow!("office needs a tokio runtime: {err}"))?,
        };

        let mut teams: HashMap<String, Arc<dyn Team>> = HashMap::new();
        for config in &self.config.teams {
            let team = build_team(config, Some(runtime.clone()))?;
            teams.insert(config.name.clone(), team);
        }
        for team in self.teams {
            teams.insert(team.name().to_string(), team);
        }

        let mut started: Vec<&Arc<dyn Team>> = Vec::with_capacity(teams.len());
        for team in teams.values() {
            if let Err(err) = team.start_working() {
                for team in started {
                    team.stop_working();
                }
                return Err(err.into());
            }
            started.push(team);
        }

        let events = self
            .events
            .unwrap_or_else(|| Arc::new(InProcEventBus::default()));
        let escalation = self
            .escalation
            .unwrap_or_else(|| Arc::new(LoggingEscalationHandler));
        let manager = OfficeManager::start(self.config.manager.clone(), &runtime, Arc::clone(&events));

        tracing::info!(
            office = %self.config.name,
            teams = teams.len(),
            managed_objects = metadata.len(),
            "office started"
        );

        Ok(Office::from_shared(OfficeShared {
            config: self.config,
            teams,
            metadata,
            manager,
            events,
            escalation,
        }))
    }
}
