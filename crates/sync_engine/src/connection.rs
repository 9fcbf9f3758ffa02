use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, broadcast::error::RecvError, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    channel::{ChannelError, ChannelLifecycle, EventChannelAdapter},
    store::{ConnectionState, ConnectionStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    Fixed { delay: Duration },
    /// Doubles the delay per attempt, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed { delay } => delay,
            Self::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1).min(16);
                base.saturating_mul(1_u32 << exponent).min(max.max(base))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub backoff: BackoffPolicy,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::Fixed {
                delay: Duration::from_millis(10_000),
            },
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTransition {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
    pub last_error: Option<String>,
    pub retries: u32,
}

impl ConnectionTransition {
    pub fn state(&self) -> ConnectionState {
        ConnectionState {
            status: self.to,
            last_error: self.last_error.clone(),
        }
    }
}

#[derive(Default)]
struct ControllerState {
    status: ConnectionStatus,
    last_error: Option<String>,
    retries: u32,
    pending_attempt: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    shut_down: bool,
}

pub struct ReconnectionController {
    adapter: Arc<EventChannelAdapter>,
    config: ReconnectConfig,
    state: Mutex<ControllerState>,
    transitions: broadcast::Sender<ConnectionTransition>,
}

impl ReconnectionController {
    pub fn new(adapter: Arc<EventChannelAdapter>, config: ReconnectConfig) -> Arc<Self> {
        let (transitions, _) = broadcast::channel(64);
        Arc::new(Self {
            adapter,
            config,
            state: Mutex::new(ControllerState::default()),
            transitions,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionTransition> {
        self.transitions.subscribe()
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.lock().await.status
    }

    pub async fn connection_state(&self) -> ConnectionState {
        let guard = self.state.lock().await;
        ConnectionState {
            status: guard.status,
            last_error: guard.last_error.clone(),
        }
    }

    pub async fn retries(&self) -> u32 {
        self.state.lock().await.retries
    }

    /// Connects the adapter and starts watching it for drops. A failed first
    /// connect is returned and leaves the controller `Disconnected`; only
    /// drops of an established connection are retried automatically.
    pub async fn start(self: &Arc<Self>) -> Result<(), ChannelError> {
        self.state.lock().await.shut_down = false;
        self.spawn_watcher().await;
        match self.adapter.connect().await {
            Ok(()) => {
                let mut guard = self.state.lock().await;
                self.enter_connected(&mut guard);
                Ok(())
            }
            Err(err) => {
                let mut guard = self.state.lock().await;
                self.transition(&mut guard, ConnectionStatus::Disconnected, Some(err.to_string()));
                Err(err)
            }
        }
    }

    pub async fn reconnect_now(self: &Arc<Self>) -> Result<(), ChannelError> {
        self.spawn_watcher().await;
        {
            let mut guard = self.state.lock().await;
            if let Some(pending) = guard.pending_attempt.take() {
                pending.abort();
            }
            guard.retries = 0;
            guard.shut_down = false;
        }
        match self.adapter.reconnect().await {
            Ok(()) => {
                let mut guard = self.state.lock().await;
                self.enter_connected(&mut guard);
                Ok(())
            }
            Err(err) => {
                let mut guard = self.state.lock().await;
                self.transition(&mut guard, ConnectionStatus::Disconnected, Some(err.to_string()));
                Err(err)
            }
        }
    }

    pub async fn shutdown(&self) {
        {
            let mut guard = self.state.lock().await;
            guard.shut_down = true;
            if let Some(pending) = guard.pending_attempt.take() {
                pending.abort();
            }
            if let Some(watcher) = guard.watcher.take() {
                watcher.abort();
            }
            guard.retries = 0;
            self.transition(&mut guard, ConnectionStatus::Disconnected, None);
        }
        self.adapter.disconnect().await;
    }

    async fn spawn_watcher(self: &Arc<Self>) {
        let mut guard = self.state.lock().await;
        if guard
            .watcher
            .as_ref()
            .is_some_and(|watcher| !watcher.is_finished())
        {
            return;
        }
        let mut lifecycle = self.adapter.lifecycle();
        let controller = Arc::downgrade(self);
        guard.watcher = Some(tokio::spawn(async move {
            loop {
                let event = match lifecycle.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "connection lifecycle lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                if let ChannelLifecycle::Closed { reason } = event {
                    controller.handle_transport_lost(reason).await;
                }
            }
        }));
    }

    async fn handle_transport_lost(self: &Arc<Self>, reason: String) {
        let mut guard = self.state.lock().await;
        if guard.status != ConnectionStatus::Connected {
            return;
        }
        warn!(%reason, "push channel lost; scheduling reconnect");
        guard.retries = 0;
        self.transition(&mut guard, ConnectionStatus::Reconnecting, Some(reason));
        self.schedule_attempt(&mut guard);
    }

    fn schedule_attempt(self: &Arc<Self>, guard: &mut ControllerState) {
        let attempt = guard.retries + 1;
        let delay = self.config.backoff.delay_for(attempt);
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        let controller = Arc::clone(self);
        if let Some(previous) = guard.pending_attempt.replace(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            controller.run_attempt().await;
        })) {
            previous.abort();
        }
    }

    async fn run_attempt(self: &Arc<Self>) {
        // The handle stays in `pending_attempt` while the reconnect runs so
        // `shutdown` and `reconnect_now` can abort it.
        if self.state.lock().await.status != ConnectionStatus::Reconnecting {
            return;
        }

        let result = self.adapter.reconnect().await;

        let mut guard = self.state.lock().await;
        if guard.shut_down || guard.status != ConnectionStatus::Reconnecting {
            let reopened = guard.shut_down && result.is_ok();
            drop(guard);
            if reopened {
                debug!("reconnect finished after shutdown; closing again");
                self.adapter.disconnect().await;
            }
            return;
        }
        guard.pending_attempt.take();
        match result {
            Ok(()) => {
                info!(retries = guard.retries, "push channel reconnected");
                self.enter_connected(&mut guard);
            }
            Err(err) => {
                guard.retries += 1;
                if guard.retries >= self.config.max_attempts {
                    let message = format!(
                        "gave up reconnecting after {} attempts: {err}",
                        guard.retries
                    );
                    error!(retries = guard.retries, %err, "reconnect attempts exhausted");
                    self.transition(&mut guard, ConnectionStatus::Disconnected, Some(message));
                } else {
                    warn!(retries = guard.retries, %err, "reconnect attempt failed");
                    self.transition(&mut guard, ConnectionStatus::Reconnecting, Some(err.to_string()));
                    self.schedule_attempt(&mut guard);
                }
            }
        }
    }

    fn enter_connected(&self, guard: &mut ControllerState) {
        guard.retries = 0;
        self.transition(guard, ConnectionStatus::Connected, None);
    }

    fn transition(
        &self,
        guard: &mut ControllerState,
        to: ConnectionStatus,
        last_error: Option<String>,
    ) {
        let from = guard.status;
        guard.status = to;
        guard.last_error = last_error.clone();
        let _ = self.transitions.send(ConnectionTransition {
            from,
            to,
            last_error,
            retries: guard.retries,
        });
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
