use std::{
    fmt::{self, Display},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::oneshot,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    ledger::BalanceLedger,
    sandbox::{Sandbox, SandboxExit},
    token::Token,
    HostError,
};

use super::{InstanceRegistry, ManagerConfig};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A live, metered sandbox instance of one token's contract.
pub struct Instance {
    /// The token the instance serves.
    token: Token,

    /// Control over the running sandbox.
    sandbox: Arc<dyn Sandbox>,

    /// Wall-clock creation time, for reporting.
    created_at: DateTime<Utc>,

    /// Monotonic creation time. Activity is measured from here.
    started: Instant,

    /// Milliseconds after `started` at which a byte last moved in either direction.
    last_activity_ms: AtomicU64,

    /// Compute units charged so far.
    charged: AtomicU64,

    /// Client streams currently piped into the sandbox.
    active_streams: AtomicUsize,

    /// Why the instance was terminated. Set at most once.
    reason: OnceLock<TerminationReason>,

    /// Cancelled when the instance is terminated; stops metering and every pipe.
    cancel: CancellationToken,
}

/// Why an instance was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The balance could not pay for the last tick or reached zero.
    BalanceExhausted,

    /// No byte moved for longer than the idle budget.
    IdleTimeout,

    /// The sandbox stopped on its own.
    SandboxExited,

    /// The ledger no longer knows the token.
    TokenRevoked,

    /// The host is shutting down or the instance was stopped explicitly.
    Shutdown,
}

/// A point-in-time view of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// The token the instance serves.
    pub token: Token,

    /// When the instance was created.
    pub created_at: DateTime<Utc>,

    /// When a byte last moved in either direction.
    pub last_activity: DateTime<Utc>,

    /// Compute units charged so far.
    pub charged: u64,

    /// Client streams currently piped into the instance.
    pub active_streams: usize,
}

/// Converts elapsed time into compute units.
///
/// Each conversion takes the floor of the accumulated milliseconds divided by the rate and
/// carries the remainder into the next one, so the total charged after `t` milliseconds is
/// always `floor(t / ms_per_unit)` no matter how the time was sliced into ticks.
#[derive(Debug, Clone)]
pub struct Meter {
    ms_per_unit: u64,
    carry_ms: u64,
}

/// Keeps an instance's stream count up to date for as long as a pipe runs.
pub(crate) struct StreamGuard<'a> {
    instance: &'a Instance,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Instance {
    pub(crate) fn new(token: Token, sandbox: Arc<dyn Sandbox>, cancel: CancellationToken) -> Self {
        Self {
            token,
            sandbox,
            created_at: Utc::now(),
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            charged: AtomicU64::new(0),
            active_streams: AtomicUsize::new(0),
            reason: OnceLock::new(),
            cancel,
        }
    }

    /// Returns the token the instance serves.
    pub fn token(&self) -> &Token {
        &self.token
    }

    /// Returns the sandbox backing the instance.
    pub fn sandbox(&self) -> &Arc<dyn Sandbox> {
        &self.sandbox
    }

    /// Returns the compute units charged so far.
    pub fn charged(&self) -> u64 {
        self.charged.load(Ordering::Acquire)
    }

    /// Returns the number of client streams currently piped into the instance.
    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::Acquire)
    }

    /// Returns true once the instance has been told to terminate.
    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns why the instance was terminated, if it was.
    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.reason.get().copied()
    }

    /// Completes when the instance is terminated.
    pub async fn terminated(&self) {
        self.cancel.cancelled().await
    }

    /// Marks the instance for teardown.
    ///
    /// Only the first call records its reason and returns true; later calls are no-ops. The
    /// owning task performs the actual teardown once its in-flight charge has resolved.
    pub fn terminate(&self, reason: TerminationReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        if first {
            tracing::debug!(token = %self.token, %reason, "instance marked for termination");
        }
        self.cancel.cancel();
        first
    }

    /// Records that a byte moved.
    pub fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::AcqRel);
    }

    /// Returns how long the instance has gone without traffic as of `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = self.started + Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire));
        now.saturating_duration_since(last)
    }

    /// Returns a snapshot of the instance.
    pub fn info(&self) -> InstanceInfo {
        let last_activity_ms = self.last_activity_ms.load(Ordering::Acquire);
        InstanceInfo {
            token: self.token.clone(),
            created_at: self.created_at,
            last_activity: self.created_at
                + chrono::Duration::milliseconds(last_activity_ms as i64),
            charged: self.charged(),
            active_streams: self.active_streams(),
        }
    }

    pub(crate) fn stream_opened(&self) -> StreamGuard<'_> {
        self.active_streams.fetch_add(1, Ordering::AcqRel);
        StreamGuard { instance: self }
    }
}

impl Meter {
    /// Creates a meter billing one unit per `ms_per_unit` milliseconds.
    pub fn new(ms_per_unit: u64) -> Self {
        Self {
            ms_per_unit: ms_per_unit.max(1),
            carry_ms: 0,
        }
    }

    /// Returns the whole units owed for `elapsed`, carrying the remainder.
    pub fn units(&mut self, elapsed: Duration) -> u64 {
        let total_ms = self.carry_ms + elapsed.as_millis() as u64;
        self.carry_ms = total_ms % self.ms_per_unit;
        total_ms / self.ms_per_unit
    }

    /// Puts back units whose charge could not be applied, so the next tick bills them.
    pub fn refund(&mut self, units: u64) {
        self.carry_ms += units * self.ms_per_unit;
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The owning task of an instance: meters it on every tick, watches the sandbox, and tears
/// everything down once the instance is terminated for any reason.
pub(crate) async fn run(
    instance: Arc<Instance>,
    mut exited: oneshot::Receiver<SandboxExit>,
    ledger: Arc<dyn BalanceLedger>,
    registry: Arc<InstanceRegistry>,
    config: ManagerConfig,
) {
    let token = instance.token().clone();
    let poll_interval = config.poll_interval;
    let mut meter = Meter::new(config.milliseconds_per_compute_unit);
    let mut ticker = time::interval_at(instance.started + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_tick = instance.started;
    let mut sandbox_gone = false;

    loop {
        tokio::select! {
            biased;

            _ = instance.cancel.cancelled() => break,

            exit = &mut exited => {
                let exit = exit.unwrap_or_else(|_| SandboxExit::Failed {
                    error: "sandbox exit notification dropped".to_string(),
                });
                tracing::warn!(token = %token, ?exit, "sandbox stopped unexpectedly");
                sandbox_gone = true;
                instance.terminate(TerminationReason::SandboxExited);
                break;
            }

            _ = ticker.tick() => {
                let now = Instant::now();
                let units = meter.units(now.saturating_duration_since(last_tick));
                last_tick = now;

                if units > 0 {
                    match ledger.try_charge(&token, units).await {
                        Ok(charge) => {
                            instance.charged.fetch_add(charge.charged, Ordering::AcqRel);
                            tracing::trace!(
                                token = %token,
                                units,
                                charged = charge.charged,
                                remaining = charge.remaining,
                                "metered instance"
                            );

                            if charge.exhausted(units) {
                                instance.terminate(TerminationReason::BalanceExhausted);
                                break;
                            }
                        }
                        Err(HostError::TokenNotFound(_)) => {
                            instance.terminate(TerminationReason::TokenRevoked);
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(token = %token, units, error = %e, "charge failed, retrying next tick");
                            meter.refund(units);
                        }
                    }
                }

                if instance.idle_for(now) >= config.idle_timeout {
                    instance.terminate(TerminationReason::IdleTimeout);
                    break;
                }
            }
        }
    }

    let reason = instance
        .termination_reason()
        .unwrap_or(TerminationReason::Shutdown);

    if !sandbox_gone {
        if let Err(e) = instance.sandbox.terminate().await {
            tracing::error!(token = %token, error = %e, "failed to terminate sandbox");
        }
    }

    registry.remove(&instance);
    tracing::info!(
        token = %token,
        %reason,
        charged = instance.charged(),
        "instance torn down"
    );
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        self.instance.active_streams.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            TerminationReason::BalanceExhausted => "balance exhausted",
            TerminationReason::IdleTimeout => "idle timeout",
            TerminationReason::SandboxExited => "sandbox exited",
            TerminationReason::TokenRevoked => "token revoked",
            TerminationReason::Shutdown => "shutdown",
        };
        write!(f, "{}", reason)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("token", &self.token)
            .field("created_at", &self.created_at)
            .field("charged", &self.charged())
            .field("active_streams", &self.active_streams())
            .field("reason", &self.termination_reason())
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
