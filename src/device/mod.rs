//! Per-target operational state machine: a named graph of states, a hop
//! table of commands that move between them, and a command/event registry
//! indexed by the current state.
//!
//! `goto_state` is the teacher's connection-handling shape turned into a
//! graph walk: each hop is just a [`Command`](crate::observer::command::Command)
//! started and awaited in turn, and a failed hop leaves the device at the
//! last state it actually reached, the same way a failed `Handler::run`
//! leaves the teacher's connection wherever it stopped rather than
//! unwinding earlier work.

pub mod factory;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{Duration, Instant};
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::fanout::{Chunk, FanoutConnection, Intake};
use crate::observer::ObserverHandle;
use crate::publisher::{Publisher, SubscriberId};
use crate::scheduler::Scheduler;

pub use factory::{DeviceClassRegistry, DeviceConstructor, DeviceFactory};

/// Initial state of every device before any hop has run.
pub const NOT_CONNECTED: &str = "NOT_CONNECTED";

/// One state-change notification, emitted after the new state is stored.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub from: String,
    pub to: String,
    pub reason: String,
    pub at: Instant,
}

/// A configured edge between two device states.
#[derive(Clone)]
pub struct HopTransition {
    pub command: String,
    pub params: HashMap<String, String>,
    pub expected_prompt: String,
    pub reverse_command: Option<String>,
}

/// Builds the observer bound to a device's connection for one named
/// command or event. The parser catalog itself lives outside this crate;
/// a factory is how a concrete parser plugs into a device's registry.
pub type CommandFactory = Arc<
    dyn Fn(Arc<FanoutConnection>, Scheduler, HashMap<String, String>) -> Arc<dyn ObserverHandle>
        + Send
        + Sync,
>;

/// Backoff parameters for [`Device`]'s auto-reconnect (spec.md 9, Open
/// Questions: "initial 1 s, factor 2, cap 30 s").
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            initial_delay: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// A no-op [`Intake`] whose only job is to notice the connection going
/// away and kick off [`Device`]'s `NOT_CONNECTED` transition / reconnect.
struct ConnectionWatcher {
    device: std::sync::Weak<Device>,
    intentional_close: Arc<AtomicBool>,
}

impl Intake for ConnectionWatcher {
    fn feed(&self, _chunk: &Chunk) {}

    fn connection_lost(&self) {
        if self.intentional_close.load(Ordering::Acquire) {
            return;
        }
        if let Some(device) = self.device.upgrade() {
            device.handle_connection_lost();
        }
    }

    fn is_terminal(&self) -> bool {
        self.device.strong_count() == 0
    }
}

/// A named target bound to one fan-out connection, a graph of states, and
/// a registry of commands/events available per state.
pub struct Device {
    name: String,
    connection: Arc<FanoutConnection>,
    scheduler: Scheduler,
    state: Mutex<String>,
    // Held for the whole duration of a transition so concurrent
    // `goto_state` calls queue up rather than interleave (spec.md 5).
    transition_lock: AsyncMutex<()>,
    graph: HashMap<String, BTreeMap<String, HopTransition>>,
    commands: HashMap<(String, String), CommandFactory>,
    events: HashMap<(String, String), CommandFactory>,
    state_changes: Publisher<StateChange>,
    hop_timeout: Duration,
    local_state: String,
    auto_reconnect: Option<ReconnectPolicy>,
    intentional_close: Arc<AtomicBool>,
}

/// Accumulates hops, command/event factories, and registers them into a
/// [`Device`] at construction; mirrors the way the teacher's `Listener` is
/// assembled field-by-field in `server::run` before its tasks start.
pub struct DeviceBuilder {
    name: String,
    connection: Arc<FanoutConnection>,
    scheduler: Scheduler,
    initial_state: String,
    local_state: String,
    hop_timeout: Duration,
    auto_reconnect: Option<ReconnectPolicy>,
    graph: HashMap<String, BTreeMap<String, HopTransition>>,
    commands: HashMap<(String, String), CommandFactory>,
    events: HashMap<(String, String), CommandFactory>,
}

impl DeviceBuilder {
    pub fn new(
        name: impl Into<String>,
        connection: Arc<FanoutConnection>,
        scheduler: Scheduler,
        initial_state: impl Into<String>,
    ) -> Self {
        DeviceBuilder {
            name: name.into(),
            connection,
            scheduler,
            initial_state: initial_state.into(),
            local_state: "UNIX_LOCAL".to_string(),
            hop_timeout: Duration::from_secs(30),
            auto_reconnect: None,
            graph: HashMap::new(),
            commands: HashMap::new(),
            events: HashMap::new(),
        }
    }

    /// State `close()` walks back to before dropping the transport.
    /// Defaults to `"UNIX_LOCAL"`.
    pub fn local_state(mut self, state: impl Into<String>) -> Self {
        self.local_state = state.into();
        self
    }

    pub fn hop_timeout(mut self, timeout: Duration) -> Self {
        self.hop_timeout = timeout;
        self
    }

    pub fn auto_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.auto_reconnect = Some(policy);
        self
    }

    /// Register a hop `from -> to`, effected by running `command`. If
    /// `reverse_command` is given, the opposite edge `to -> from` is
    /// registered too, using it.
    pub fn hop(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        command: impl Into<String>,
        params: HashMap<String, String>,
        expected_prompt: impl Into<String>,
        reverse_command: Option<String>,
    ) -> Self {
        let from = from.into();
        let to = to.into();
        let command = command.into();
        let expected_prompt = expected_prompt.into();

        if let Some(reverse) = &reverse_command {
            self.graph.entry(to.clone()).or_default().insert(
                from.clone(),
                HopTransition {
                    command: reverse.clone(),
                    params: HashMap::new(),
                    expected_prompt: expected_prompt.clone(),
                    reverse_command: Some(command.clone()),
                },
            );
        }
        self.graph.entry(from).or_default().insert(
            to,
            HopTransition {
                command,
                params,
                expected_prompt,
                reverse_command,
            },
        );
        self
    }

    /// Register `factory` as the command named `name`, available while the
    /// device is in `state`.
    pub fn command(
        mut self,
        state: impl Into<String>,
        name: impl Into<String>,
        factory: CommandFactory,
    ) -> Self {
        self.commands.insert((state.into(), name.into()), factory);
        self
    }

    pub fn event(
        mut self,
        state: impl Into<String>,
        name: impl Into<String>,
        factory: CommandFactory,
    ) -> Self {
        self.events.insert((state.into(), name.into()), factory);
        self
    }

    pub fn build(self) -> Arc<Device> {
        let connection = self.connection.clone();
        let intentional_close = Arc::new(AtomicBool::new(false));
        let ic = intentional_close.clone();

        let device = Arc::new_cyclic(|_weak| Device {
            name: self.name,
            connection: self.connection,
            scheduler: self.scheduler,
            state: Mutex::new(self.initial_state),
            transition_lock: AsyncMutex::new(()),
            graph: self.graph,
            commands: self.commands,
            events: self.events,
            state_changes: Publisher::new(),
            hop_timeout: self.hop_timeout,
            local_state: self.local_state,
            auto_reconnect: self.auto_reconnect,
            intentional_close: ic,
        });

        let watcher: Arc<dyn Intake> = Arc::new(ConnectionWatcher {
            device: Arc::downgrade(&device),
            intentional_close,
        });
        // The handle is dropped immediately: `SubscriptionHandle` only
        // unsubscribes when `unsubscribe()` is called explicitly, so the
        // watcher stays registered for the connection's lifetime. It is
        // reaped the same way a terminal observer is: `is_terminal` reports
        // true once `device` itself has been dropped.
        let _ = connection.subscribe(watcher);

        device
    }
}

impl Device {
    pub fn builder(
        name: impl Into<String>,
        connection: Arc<FanoutConnection>,
        scheduler: Scheduler,
        initial_state: impl Into<String>,
    ) -> DeviceBuilder {
        DeviceBuilder::new(name, connection, scheduler, initial_state)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current_state(&self) -> String {
        self.state.lock().unwrap().clone()
    }

    pub fn add_state_change_subscriber<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.state_changes.subscribe(callback)
    }

    pub fn remove_state_change_subscriber(&self, id: SubscriberId) {
        self.state_changes.unsubscribe(id);
    }

    /// Look up the command registered for `name` in the current state and
    /// build the observer bound to this device's connection.
    pub fn get_cmd(&self, name: &str, params: HashMap<String, String>) -> Result<Arc<dyn ObserverHandle>> {
        let state = self.current_state();
        let factory = self
            .commands
            .get(&(state.clone(), name.to_string()))
            .ok_or_else(|| Error::NotAllowed {
                state,
                name: name.to_string(),
            })?;
        Ok(factory(self.connection.clone(), self.scheduler.clone(), params))
    }

    pub fn get_event(&self, name: &str, params: HashMap<String, String>) -> Result<Arc<dyn ObserverHandle>> {
        let state = self.current_state();
        let factory = self
            .events
            .get(&(state.clone(), name.to_string()))
            .ok_or_else(|| Error::NotAllowed {
                state,
                name: name.to_string(),
            })?;
        Ok(factory(self.connection.clone(), self.scheduler.clone(), params))
    }

    /// Shortest path (BFS, ties broken by lexicographic neighbour name via
    /// `BTreeMap` iteration order) from `from` to `target`.
    fn shortest_path(&self, from: &str, target: &str) -> Option<Vec<String>> {
        if from == target {
            return Some(vec![from.to_string()]);
        }
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(from.to_string());
        let mut queue: VecDeque<Vec<String>> = VecDeque::new();
        queue.push_back(vec![from.to_string()]);

        while let Some(path) = queue.pop_front() {
            let last = path.last().expect("path always has at least one state").clone();
            let Some(neighbors) = self.graph.get(&last) else {
                continue;
            };
            for next in neighbors.keys() {
                if !visited.insert(next.clone()) {
                    continue;
                }
                let mut extended = path.clone();
                extended.push(next.clone());
                if next == target {
                    return Some(extended);
                }
                queue.push_back(extended);
            }
        }
        None
    }

    async fn execute_hop(&self, from: &str, hop: &HopTransition, timeout: Duration) -> Result<()> {
        let cmd = self
            .commands
            .get(&(from.to_string(), hop.command.clone()))
            .ok_or_else(|| Error::NotAllowed {
                state: from.to_string(),
                name: hop.command.clone(),
            })?(self.connection.clone(), self.scheduler.clone(), hop.params.clone());

        cmd.start(timeout).await?;
        cmd.await_done(timeout).await
    }

    /// Walk the shortest hop path from the current state to `target`,
    /// running each hop's command in turn. A failed hop leaves the device
    /// in the last state it reached and surfaces the underlying failure
    /// wrapped in [`Error::HopFailure`]. Idempotent when already at `target`.
    #[instrument(skip(self), fields(device = %self.name, target = %target))]
    pub async fn goto_state(&self, target: &str, timeout: Duration) -> Result<()> {
        let _guard = self.transition_lock.lock().await;

        let current = self.current_state();
        if current == target {
            return Ok(());
        }
        let path = self
            .shortest_path(&current, target)
            .ok_or_else(|| Error::NoPath {
                from: current.clone(),
                to: target.to_string(),
            })?;

        let mut from = current;
        for to in path.into_iter().skip(1) {
            let hop = self
                .graph
                .get(&from)
                .and_then(|m| m.get(&to))
                .cloned()
                .ok_or_else(|| Error::NoPath {
                    from: from.clone(),
                    to: to.clone(),
                })?;

            if let Err(source) = self.execute_hop(&from, &hop, timeout).await {
                self.state_changes.notify_subscribers(StateChange {
                    from: from.clone(),
                    to: to.clone(),
                    reason: "failure".to_string(),
                    at: Instant::now(),
                });
                return Err(Error::HopFailure {
                    from,
                    to,
                    stage: hop.command.clone(),
                    source: Box::new(source),
                });
            }

            *self.state.lock().unwrap() = to.clone();
            self.state_changes.notify_subscribers(StateChange {
                from: from.clone(),
                to: to.clone(),
                reason: "goto_state".to_string(),
                at: Instant::now(),
            });
            from = to;
        }
        Ok(())
    }

    /// Same as [`goto_state`](Device::goto_state) but runs on a background
    /// task and returns a handle immediately.
    pub fn goto_state_bg(self: &Arc<Self>, target: impl Into<String>) -> tokio::task::JoinHandle<Result<()>> {
        let target = target.into();
        let device = self.clone();
        let timeout = self.hop_timeout;
        tokio::spawn(async move { device.goto_state(&target, timeout).await })
    }

    fn handle_connection_lost(self: Arc<Self>) {
        let previous = {
            let mut state = self.state.lock().unwrap();
            let previous = state.clone();
            *state = NOT_CONNECTED.to_string();
            previous
        };
        if previous == NOT_CONNECTED {
            return;
        }
        warn!(device = %self.name, from = %previous, "connection lost");
        self.state_changes.notify_subscribers(StateChange {
            from: previous.clone(),
            to: NOT_CONNECTED.to_string(),
            reason: "connection_lost".to_string(),
            at: Instant::now(),
        });

        if let Some(policy) = self.auto_reconnect {
            tokio::spawn(self.reconnect_loop(previous, policy));
        }
    }

    async fn reconnect_loop(self: Arc<Self>, target: String, policy: ReconnectPolicy) {
        let mut delay = policy.initial_delay;
        loop {
            tokio::time::sleep(delay).await;
            match self.goto_state(&target, self.hop_timeout).await {
                Ok(()) => {
                    info!(device = %self.name, state = %target, "auto-reconnect succeeded");
                    return;
                }
                Err(err) => {
                    warn!(device = %self.name, %err, "auto-reconnect attempt failed, backing off");
                    delay = std::cmp::min(delay * policy.factor, policy.max_delay);
                }
            }
        }
    }

    /// Walk back to the local state and close the transport. A no-op if
    /// already `NOT_CONNECTED`.
    pub async fn close(&self) {
        if self.current_state() == NOT_CONNECTED {
            return;
        }
        self.intentional_close.store(true, Ordering::Release);
        if let Err(err) = self.goto_state(&self.local_state, self.hop_timeout).await {
            warn!(device = %self.name, %err, "close: failed to reach local state, closing transport anyway");
        }
        self.connection.close().await;

        let previous = {
            let mut state = self.state.lock().unwrap();
            let previous = state.clone();
            *state = NOT_CONNECTED.to_string();
            previous
        };
        self.state_changes.notify_subscribers(StateChange {
            from: previous,
            to: NOT_CONNECTED.to_string(),
            reason: "close".to_string(),
            at: Instant::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::command::{Command, CommandParser, ParseOutcome};
    use crate::testing::FakeConnection;
    use regex::Regex;

    struct ImmediateOk;
    impl CommandParser for ImmediateOk {
        type Output = ();
        fn command_string(&self) -> String {
            "go".to_string()
        }
        fn feed(&mut self, _chunk: &Chunk, _expected_prompt: &Regex) -> ParseOutcome<()> {
            ParseOutcome::Complete(())
        }
    }

    fn ok_factory() -> CommandFactory {
        Arc::new(|connection, scheduler, _params| {
            Command::new(ImmediateOk, connection, scheduler, Regex::new("#").unwrap()) as Arc<dyn ObserverHandle>
        })
    }

    fn make_device() -> Arc<Device> {
        let (fake, _handle) = FakeConnection::new("dev");
        let fanout = Arc::new(FanoutConnection::new(Box::new(fake), "dev"));
        Device::builder("dev", fanout, Scheduler::new("dev"), NOT_CONNECTED)
            .hop(NOT_CONNECTED, "UNIX_LOCAL", "connect", HashMap::new(), "#", None)
            .hop("UNIX_LOCAL", "UNIX_REMOTE", "ssh", HashMap::new(), "#", Some("exit".to_string()))
            .command(NOT_CONNECTED, "connect", ok_factory())
            .command("UNIX_LOCAL", "ssh", ok_factory())
            .command("UNIX_REMOTE", "exit", ok_factory())
            .build()
    }

    #[tokio::test]
    async fn goto_state_walks_shortest_path() {
        let device = make_device();
        device
            .goto_state("UNIX_REMOTE", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(device.current_state(), "UNIX_REMOTE");
    }

    #[tokio::test]
    async fn goto_state_is_idempotent_at_target() {
        let device = make_device();
        device.goto_state(NOT_CONNECTED, Duration::from_secs(1)).await.unwrap();
        assert_eq!(device.current_state(), NOT_CONNECTED);
    }

    #[tokio::test]
    async fn unregistered_command_is_not_allowed() {
        let device = make_device();
        let err = device.get_cmd("nope", HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::NotAllowed { .. }));
    }

    #[tokio::test]
    async fn no_path_to_unknown_state_is_reported() {
        let device = make_device();
        let err = device
            .goto_state("NOWHERE", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoPath { .. }));
    }
}
