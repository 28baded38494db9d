//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;

use arkfleet::cluster::ports::PortAssignment;
use arkfleet::cluster::server::{GameMap, ServerSpec};
use arkfleet::runtime::{
    LogError, LogSource, LogStream, ProcessSupervisor, RuntimeArtifact, ServerState, ServerStatus,
    SupervisorError,
};

/// In-memory supervisor that records every call in order
#[derive(Default)]
pub struct RecordingSupervisor {
    states: Mutex<HashMap<String, ServerState>>,
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight: Mutex<usize>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingSupervisor {
    pub fn with_servers(servers: &[(&str, ServerState)]) -> Arc<Self> {
        let sup = Self::default();
        {
            let mut states = sup.states.lock().unwrap();
            for (name, state) in servers {
                states.insert(name.to_string(), *state);
            }
        }
        Arc::new(sup)
    }

    /// Make a call fail, e.g. `"start:s2"` or `"exec:s1"`
    pub fn fail(&self, call: &str) {
        self.failing.lock().unwrap().insert(call.to_string());
    }

    /// Delay start/stop calls
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn state(&self, name: &str) -> Option<ServerState> {
        self.states.lock().unwrap().get(name).copied()
    }

    /// Highest number of start/stop calls seen running at once for one name
    pub fn max_concurrent_per_name(&self) -> usize {
        *self.max_in_flight.lock().unwrap()
    }

    /// Log a call; it fails if either the full call or `verb:name` is marked
    fn record(&self, verb: &str, name: &str, call: String) -> Result<(), SupervisorError> {
        self.calls.lock().unwrap().push(call.clone());
        let failing = self.failing.lock().unwrap();
        if failing.contains(&call) || failing.contains(&format!("{}:{}", verb, name)) {
            return Err(SupervisorError::CommandFailed {
                name: name.to_string(),
                message: format!("{} failed", call),
            });
        }
        Ok(())
    }

    fn known(&self, name: &str) -> Result<(), SupervisorError> {
        if self.states.lock().unwrap().contains_key(name) {
            Ok(())
        } else {
            Err(SupervisorError::NotFound(name.to_string()))
        }
    }

    async fn transition(&self, verb: &str, name: &str, to: ServerState) -> Result<(), SupervisorError> {
        self.known(name)?;
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = in_flight.entry(name.to_string()).or_insert(0);
            *count += 1;
            let mut max = self.max_in_flight.lock().unwrap();
            *max = (*max).max(*count);
        }
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(count) = self.in_flight.lock().unwrap().get_mut(name) {
            *count -= 1;
        }
        self.record(verb, name, format!("{}:{}", verb, name))?;
        self.states.lock().unwrap().insert(name.to_string(), to);
        Ok(())
    }
}

#[async_trait]
impl ProcessSupervisor for RecordingSupervisor {
    async fn start(&self, name: &str) -> Result<(), SupervisorError> {
        self.transition("start", name, ServerState::Running).await
    }

    async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        self.transition("stop", name, ServerState::Stopped).await
    }

    async fn status(&self, name: &str) -> Result<ServerStatus, SupervisorError> {
        self.known(name)?;
        let state = self.state(name).unwrap_or(ServerState::Unknown);
        Ok(ServerStatus::new(name, state))
    }

    async fn exec(&self, name: &str, command: &str) -> Result<String, SupervisorError> {
        self.known(name)?;
        self.record("exec", name, format!("exec({}):{}", command, name))?;
        Ok(format!("{} ok", command))
    }

    async fn provision(&self, spec: &ServerSpec, _artifact: &RuntimeArtifact) -> Result<(), SupervisorError> {
        self.record("provision", &spec.name, format!("provision:{}", spec.name))?;
        self.states
            .lock()
            .unwrap()
            .entry(spec.name.clone())
            .or_insert(ServerState::Stopped);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), SupervisorError> {
        self.record("remove", name, format!("remove:{}", name))?;
        self.states.lock().unwrap().remove(name);
        Ok(())
    }
}

/// Log source serving fixed lines
pub struct FixedLogs(pub Vec<String>);

#[async_trait]
impl LogSource for FixedLogs {
    async fn tail(&self, _name: &str, lines: usize) -> Result<Vec<String>, LogError> {
        let skip = self.0.len().saturating_sub(lines);
        Ok(self.0[skip..].to_vec())
    }

    async fn subscribe(&self, _name: &str) -> Result<LogStream, LogError> {
        let lines: Vec<Result<String, LogError>> = self.0.iter().cloned().map(Ok).collect();
        Ok(Box::pin(stream::iter(lines)))
    }
}

/// A standalone server spec with fixed ports
pub fn server(name: &str, offset: u16) -> ServerSpec {
    ServerSpec {
        name: name.to_string(),
        map: GameMap::TheIsland,
        session_name: name.to_string(),
        ports: PortAssignment {
            game: 7777 + offset,
            query: 27015 + offset,
            rcon: 27020 + offset,
        },
        max_players: 70,
        password: String::new(),
        admin_password: String::new(),
        mods: vec![],
        cluster_id: "test".to_string(),
        game_rules: Default::default(),
    }
}
