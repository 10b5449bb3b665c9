//! Inactivity countdown guarding a sandbox instance.
//!
//! State lives behind one mutex so activation, extension, cancellation and
//! the expiry tick never interleave. Teardown runs after the lock is
//! released and only from the tick that moved the timer to `Expired`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use utoipa::ToSchema;

use crate::config::SandboxConfig;
use crate::events::now_unix;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimerError {
    #[error("timeout is not active")]
    NotArmed,
    #[error("timeout already expired")]
    Expired,
}

#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("failed to run teardown command: {0}")]
    Io(#[from] std::io::Error),
    #[error("teardown command exited with {0}")]
    Status(std::process::ExitStatus),
}

#[async_trait]
pub trait Teardown: Send + Sync {
    async fn teardown(&self) -> Result<(), TeardownError>;
}

/// Runs a configured command, e.g. a script that destroys the sandbox VM.
#[derive(Debug, Clone)]
pub struct CommandTeardown {
    command: Vec<String>,
}

impl CommandTeardown {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Teardown for CommandTeardown {
    async fn teardown(&self) -> Result<(), TeardownError> {
        let Some((program, args)) = self.command.split_first() else {
            return Ok(());
        };
        tracing::info!(command = ?self.command, "teardown: running command");
        let status = tokio::process::Command::new(program)
            .args(args)
            .status()
            .await?;
        if !status.success() {
            return Err(TeardownError::Status(status));
        }
        Ok(())
    }
}

/// Signals the sandbox server to shut down gracefully.
#[derive(Debug, Clone, Default)]
pub struct ShutdownTeardown {
    notify: Arc<Notify>,
}

impl ShutdownTeardown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves once teardown has been requested.
    pub async fn requested(&self) {
        self.notify.notified().await;
    }
}

#[async_trait]
impl Teardown for ShutdownTeardown {
    async fn teardown(&self) -> Result<(), TeardownError> {
        tracing::info!("teardown: requesting server shutdown");
        // notify_one stores a permit if nobody is waiting yet.
        self.notify.notify_one();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TimerPhase {
    Inactive,
    Armed,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutStatus {
    pub timeout_active: bool,
    pub phase: TimerPhase,
    pub remaining_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_extended_at: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
enum TimerState {
    Inactive,
    Armed {
        deadline: Instant,
        last_extended_at: Option<i64>,
    },
    Expired,
}

pub struct TimeoutSupervisor {
    state: Mutex<TimerState>,
    teardown: Arc<dyn Teardown>,
    config: SandboxConfig,
}

impl std::fmt::Debug for TimeoutSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutSupervisor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Upper bound for a single activation or extension.
pub const MAX_TIMEOUT_MINUTES: u64 = 7 * 24 * 60;

fn minutes(value: u64) -> Duration {
    Duration::from_secs(value.min(MAX_TIMEOUT_MINUTES) * 60)
}

impl TimeoutSupervisor {
    pub fn new(config: SandboxConfig, teardown: Arc<dyn Teardown>) -> Self {
        Self {
            state: Mutex::new(TimerState::Inactive),
            teardown,
            config,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn status_of(state: &TimerState) -> TimeoutStatus {
        match *state {
            TimerState::Inactive => TimeoutStatus {
                timeout_active: false,
                phase: TimerPhase::Inactive,
                remaining_seconds: 0,
                last_extended_at: None,
            },
            TimerState::Armed {
                deadline,
                last_extended_at,
            } => TimeoutStatus {
                timeout_active: true,
                phase: TimerPhase::Armed,
                remaining_seconds: deadline.saturating_duration_since(Instant::now()).as_secs(),
                last_extended_at,
            },
            TimerState::Expired => TimeoutStatus {
                timeout_active: false,
                phase: TimerPhase::Expired,
                remaining_seconds: 0,
                last_extended_at: None,
            },
        }
    }

    /// Arms the timer for `minutes` (or the configured default). Re-activating
    /// an armed timer restarts the countdown.
    pub async fn activate(&self, minutes_opt: Option<u64>) -> TimeoutStatus {
        let duration = minutes(minutes_opt.unwrap_or(self.config.default_timeout_minutes));
        let mut state = self.state.lock().await;
        *state = TimerState::Armed {
            deadline: Instant::now() + duration,
            last_extended_at: None,
        };
        tracing::info!(minutes = duration.as_secs() / 60, "sandbox timeout activated");
        Self::status_of(&state)
    }

    /// Adds `minutes` (or the auto-extend default) to the remaining time.
    /// Only an armed timer can be extended.
    pub async fn extend(&self, minutes_opt: Option<u64>) -> Result<TimeoutStatus, TimerError> {
        let extra = minutes(minutes_opt.unwrap_or(self.config.auto_extend_minutes));
        let mut state = self.state.lock().await;
        match *state {
            TimerState::Armed { deadline, .. } => {
                let now = Instant::now();
                if deadline <= now {
                    // The tick has not caught up yet; do not resurrect it.
                    return Err(TimerError::Expired);
                }
                *state = TimerState::Armed {
                    deadline: deadline.checked_add(extra).unwrap_or(deadline),
                    last_extended_at: Some(now_unix()),
                };
                tracing::debug!(minutes = extra.as_secs() / 60, "sandbox timeout extended");
                Ok(Self::status_of(&state))
            }
            TimerState::Expired => Err(TimerError::Expired),
            TimerState::Inactive => Err(TimerError::NotArmed),
        }
    }

    /// Disarms an armed timer; a no-op otherwise.
    pub async fn cancel(&self) -> TimeoutStatus {
        let mut state = self.state.lock().await;
        if matches!(*state, TimerState::Armed { .. }) {
            *state = TimerState::Inactive;
            tracing::info!("sandbox timeout cancelled");
        }
        Self::status_of(&state)
    }

    pub async fn status(&self) -> TimeoutStatus {
        Self::status_of(&*self.state.lock().await)
    }

    pub async fn is_armed(&self) -> bool {
        matches!(*self.state.lock().await, TimerState::Armed { .. })
    }

    /// Expires an armed timer whose deadline has passed and runs teardown.
    /// Returns `true` only for the call that performed the transition.
    pub async fn tick(&self) -> bool {
        {
            let mut state = self.state.lock().await;
            match *state {
                TimerState::Armed { deadline, .. } if deadline <= Instant::now() => {
                    *state = TimerState::Expired;
                }
                _ => return false,
            }
        }
        tracing::warn!("sandbox timeout expired, tearing down");
        if let Err(err) = self.teardown.teardown().await {
            tracing::error!(error = %err, "sandbox teardown failed");
        }
        true
    }

    pub fn spawn_ticker(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.config.tick_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.tick().await;
            }
        })
    }
}

impl From<TimerError> for agentbox_error::AgentboxError {
    fn from(err: TimerError) -> Self {
        match err {
            TimerError::NotArmed | TimerError::Expired => Self::TimeoutNotActive,
        }
    }
}
