//! Stateful test double for the packet forwarder.
//!
//! Tracks actual state (running flag, installed options, selections, open
//! flows) so tests assert on the system's state after a lifecycle
//! operation, not just on which calls happened.

use async_trait::async_trait;
use tokio::sync::watch;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::forwarder::{
    Connection, Error, OutboundInfo, OutboundManager, PacketForwarder, Traffic, TrafficManager,
};
use crate::options::{Options, Outbound};

#[derive(Debug, Default)]
pub struct MockState {
    pub running: bool,
    pub options: Option<Options>,
    pub mode: String,
    /// group tag → selected child
    pub selected: HashMap<String, String>,
    pub connections: Vec<Connection>,
    pub closed: Vec<Connection>,
    pub traffic: Traffic,
    pub start_count: usize,
    /// When set, the next `start` fails with this message.
    pub fail_start: Option<String>,
}

#[derive(Clone)]
pub struct MockForwarder {
    state: Arc<Mutex<MockState>>,
    exit_tx: watch::Sender<Option<String>>,
}

impl MockForwarder {
    pub fn new() -> MockForwarder {
        let (exit_tx, _) = watch::channel(None);
        MockForwarder {
            state: Arc::new(Mutex::new(MockState::default())),
            exit_tx,
        }
    }

    pub fn state(&self) -> Arc<Mutex<MockState>> {
        self.state.clone()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut lock(&self.state))
    }

    /// Simulates the forwarder process dying underneath the service.
    pub fn trigger_exit(&self, cause: &str) {
        self.with_state(|state| state.running = false);
        let _ = self.exit_tx.send(Some(cause.to_string()));
    }

    pub fn add_connection(&self, id: &str, chain: &[&str]) {
        self.with_state(|state| {
            state.connections.push(Connection {
                id: id.to_string(),
                inbound: "tun-in".to_string(),
                chain: chain.iter().map(|c| c.to_string()).collect(),
                outbound: chain.first().map(|c| c.to_string()).unwrap_or_default(),
                ..Connection::default()
            });
        });
    }
}

impl Default for MockForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PacketForwarder for MockForwarder {
    async fn start(&self, options: Options) -> Result<(), Error> {
        self.with_state(|state| {
            if let Some(cause) = state.fail_start.take() {
                return Err(Error::Failed(cause));
            }
            state.running = true;
            state.start_count += 1;
            state.mode = options
                .experimental
                .as_ref()
                .and_then(|e| e.clash_api.as_ref())
                .and_then(|c| c.default_mode.clone())
                .unwrap_or_else(|| "auto".to_string());
            // every group starts out on its first child
            for outbound in &options.outbounds {
                if let Some(first) = outbound.children().first() {
                    state.selected.insert(outbound.tag().to_string(), first.clone());
                }
            }
            state.options = Some(options);
            Ok(())
        })
    }

    async fn close(&self) -> Result<(), Error> {
        self.with_state(|state| {
            state.running = false;
            let drained: Vec<Connection> = state.connections.drain(..).collect();
            state.closed.extend(drained);
        });
        Ok(())
    }

    async fn mode(&self) -> Result<String, Error> {
        Ok(self.with_state(|state| state.mode.clone()))
    }

    async fn set_mode(&self, mode: &str) -> Result<(), Error> {
        self.with_state(|state| state.mode = mode.to_string());
        Ok(())
    }

    fn traffic(&self) -> Arc<dyn TrafficManager> {
        Arc::new(MockTraffic {
            state: self.state.clone(),
        })
    }

    fn outbounds(&self) -> Arc<dyn OutboundManager> {
        Arc::new(MockOutbounds {
            state: self.state.clone(),
        })
    }

    fn exit_watch(&self) -> watch::Receiver<Option<String>> {
        self.exit_tx.subscribe()
    }
}

struct MockTraffic {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl TrafficManager for MockTraffic {
    async fn total(&self) -> Result<Traffic, Error> {
        Ok(lock(&self.state).traffic)
    }

    async fn connections(&self) -> Result<Vec<Connection>, Error> {
        Ok(lock(&self.state).connections.clone())
    }

    async fn closed_connections(&self) -> Result<Vec<Connection>, Error> {
        Ok(lock(&self.state).closed.clone())
    }

    async fn close(&self, ids: &[String]) -> Result<(), Error> {
        let mut state = lock(&self.state);
        let (closing, keep): (Vec<Connection>, Vec<Connection>) =
            state.connections.drain(..).partition(|c| ids.contains(&c.id));
        state.connections = keep;
        state.closed.extend(closing);
        Ok(())
    }

    async fn close_all(&self) -> Result<(), Error> {
        let mut state = lock(&self.state);
        let drained: Vec<Connection> = state.connections.drain(..).collect();
        state.closed.extend(drained);
        Ok(())
    }
}

struct MockOutbounds {
    state: Arc<Mutex<MockState>>,
}

fn info_for(state: &MockState, outbound: &Outbound) -> OutboundInfo {
    OutboundInfo {
        tag: outbound.tag().to_string(),
        kind: outbound.kind().to_string(),
        selected: state.selected.get(outbound.tag()).cloned(),
        children: outbound.children().to_vec(),
    }
}

#[async_trait]
impl OutboundManager for MockOutbounds {
    async fn outbounds(&self) -> Result<Vec<OutboundInfo>, Error> {
        let state = lock(&self.state);
        let Some(options) = &state.options else { return Ok(Vec::new()) };
        Ok(options.outbounds.iter().map(|o| info_for(&state, o)).collect())
    }

    async fn outbound(&self, tag: &str) -> Result<Option<OutboundInfo>, Error> {
        let state = lock(&self.state);
        let Some(options) = &state.options else { return Ok(None) };
        Ok(options.find_outbound(tag).map(|o| info_for(&state, o)))
    }

    async fn select(&self, group_tag: &str, outbound_tag: &str) -> Result<(), Error> {
        let mut state = lock(&self.state);
        let children = {
            let Some(options) = &state.options else {
                return Err(Error::NotRunning);
            };
            let Some(group) = options.find_outbound(group_tag) else {
                return Err(Error::GroupNotFound(group_tag.to_string()));
            };
            group.children().to_vec()
        };
        if !children.iter().any(|c| c == outbound_tag) {
            return Err(Error::TagNotFound(outbound_tag.to_string()));
        }
        state.selected.insert(group_tag.to_string(), outbound_tag.to_string());
        Ok(())
    }
}

fn lock(state: &Mutex<MockState>) -> std::sync::MutexGuard<'_, MockState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
