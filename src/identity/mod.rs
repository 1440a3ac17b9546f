//! Credentialed identities and their daily quotas
//!
//! [`IdentityPool`] owns every identity's counters behind one lock. Workers
//! take a [`Lease`] with [`IdentityPool::acquire`] (or the waiting variant),
//! perform one attempt, and hand the lease back with
//! [`IdentityPool::release`] and the attempt's [`AttemptOutcome`].
//!
//! A lease reserves one unit of the identity's daily quota while it is held,
//! so usage plus in-flight attempts never exceeds the quota no matter how
//! many workers run at once.

use crate::config::{IdentityConfig, RotationConfig};
use crate::types::IdentityId;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

/// Authentication secret; never printed
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the raw value to an authenticator
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// One credentialed account
#[derive(Debug, Clone)]
pub struct Identity {
    /// Unique identifier (usually the account email)
    pub id: IdentityId,
    /// Opaque secret handed to the authenticator
    pub secret: Secret,
    /// Downloads allowed per local calendar day
    pub max_daily_downloads: u32,
}

impl From<&IdentityConfig> for Identity {
    fn from(config: &IdentityConfig) -> Self {
        Self {
            id: IdentityId::new(config.id.clone()),
            secret: Secret::new(config.secret.clone()),
            max_daily_downloads: config.max_daily_downloads,
        }
    }
}

/// Right to perform one attempt under an identity
///
/// Must be returned through [`IdentityPool::release`]; the reserved quota
/// unit stays taken until then.
#[derive(Debug)]
pub struct Lease {
    index: usize,
    identity: Arc<Identity>,
}

impl Lease {
    /// Identity this lease is for
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Identity ID
    pub fn id(&self) -> &IdentityId {
        &self.identity.id
    }
}

/// What an attempt under a lease amounted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Artifact downloaded: consumes quota, clears the failure streak
    Success,
    /// Attempt failed in a way that reflects on the identity
    Failure,
    /// Attempt failed for reasons unrelated to the identity (404, cancelled)
    ItemFault,
    /// Lease went unused because the artifact was already on disk
    Unused,
    /// The service reported the identity's quota as used up
    QuotaExhausted,
}

/// Change of active identity caused by a release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotation {
    /// Identity that was active
    pub from: IdentityId,
    /// Newly active identity, if any is left
    pub to: Option<IdentityId>,
    /// Why the pointer moved
    pub reason: String,
}

/// Point-in-time view of one identity, for status output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentitySnapshot {
    /// Identity ID
    pub id: IdentityId,
    /// Downloads counted today
    pub usage: u32,
    /// Daily quota
    pub quota: u32,
    /// Attempts currently holding a lease
    pub in_flight: u32,
    /// Current failure streak
    pub consecutive_failures: u32,
    /// Deactivated for the rest of the run
    pub rotated_out: bool,
    /// Currently the preferred identity
    pub active: bool,
}

struct IdentityState {
    identity: Arc<Identity>,
    usage: u32,
    in_flight: u32,
    last_reset: NaiveDate,
    consecutive_failures: u32,
    rotated_out: bool,
    next_request_at: Option<Instant>,
}

impl IdentityState {
    fn quota(&self) -> u32 {
        self.identity.max_daily_downloads
    }

    /// Can serve downloads today (ignoring current reservations)
    fn serviceable(&self) -> bool {
        !self.rotated_out && self.usage < self.quota()
    }

    /// Can take another lease right now
    fn has_capacity(&self) -> bool {
        !self.rotated_out && self.usage.saturating_add(self.in_flight) < self.quota()
    }
}

struct PoolState {
    identities: Vec<IdentityState>,
    active: usize,
    successes_on_active: u32,
}

impl PoolState {
    fn roll_over(&mut self, today: NaiveDate) {
        for state in &mut self.identities {
            if today > state.last_reset {
                tracing::info!(
                    identity = %state.identity.id,
                    previous_usage = state.usage,
                    "daily quota reset"
                );
                state.usage = 0;
                state.last_reset = today;
            }
        }
    }

    /// Next serviceable identity after `from`, wrapping once
    fn next_serviceable(&self, from: usize) -> Option<usize> {
        let len = self.identities.len();
        (1..=len)
            .map(|offset| (from + offset) % len)
            .find(|&i| self.identities[i].serviceable())
    }

    /// Move the active pointer past the current identity
    fn advance(&mut self, reason: String) -> Option<Rotation> {
        let from = self.active;
        let next = self.next_serviceable(from).filter(|&i| i != from);
        self.successes_on_active = 0;

        match next {
            Some(i) => {
                self.active = i;
                Some(Rotation {
                    from: self.identities[from].identity.id.clone(),
                    to: Some(self.identities[i].identity.id.clone()),
                    reason,
                })
            }
            None if !self.identities[from].serviceable() => Some(Rotation {
                from: self.identities[from].identity.id.clone(),
                to: None,
                reason,
            }),
            // Nothing else to rotate to, keep using the current one
            None => None,
        }
    }

    fn any_serviceable(&self) -> bool {
        self.identities.iter().any(IdentityState::serviceable)
    }

    /// Some reservation may still come back as spare capacity
    fn may_free_up(&self) -> bool {
        self.identities
            .iter()
            .any(|s| s.serviceable() && s.in_flight > 0)
    }
}

enum TryAcquire {
    Leased(Lease),
    Busy,
    Exhausted,
}

/// Fixed set of identities with quotas, failure rotation and pacing
pub struct IdentityPool {
    state: Mutex<PoolState>,
    released: Notify,
    clock: Arc<dyn Clock>,
    rotation: RotationConfig,
    request_delay: Duration,
}

impl IdentityPool {
    /// Create a pool using the system clock
    pub fn new(identities: Vec<Identity>, rotation: RotationConfig, request_delay: Duration) -> Self {
        Self::with_clock(identities, rotation, request_delay, Arc::new(SystemClock))
    }

    /// Create a pool with an explicit clock
    pub fn with_clock(
        identities: Vec<Identity>,
        rotation: RotationConfig,
        request_delay: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let today = clock.today();
        let identities = identities
            .into_iter()
            .map(|identity| IdentityState {
                identity: Arc::new(identity),
                usage: 0,
                in_flight: 0,
                last_reset: today,
                consecutive_failures: 0,
                rotated_out: false,
                next_request_at: None,
            })
            .collect();

        Self {
            state: Mutex::new(PoolState {
                identities,
                active: 0,
                successes_on_active: 0,
            }),
            released: Notify::new(),
            clock,
            rotation,
            request_delay,
        }
    }

    /// Unix timestamp from which today's usage is counted
    pub fn day_start_timestamp(&self) -> i64 {
        self.clock.midnight_timestamp()
    }

    /// Set today's usage counters, typically from the ledger
    pub async fn seed_usage(&self, usage: &HashMap<IdentityId, u32>) {
        let today = self.clock.today();
        let mut state = self.state.lock().await;
        for identity in &mut state.identities {
            if let Some(&count) = usage.get(&identity.identity.id) {
                identity.usage = count;
                identity.last_reset = today;
                tracing::info!(
                    identity = %identity.identity.id,
                    usage = count,
                    quota = identity.quota(),
                    "restored today's usage"
                );
            }
        }
        if !state.identities.is_empty() && !state.identities[state.active].serviceable() {
            state.advance("quota already used today".to_string());
        }
    }

    /// Take a lease without waiting
    ///
    /// Prefers the active identity; falls back to the next identity with
    /// capacity in round-robin order. Returns `None` when no identity has
    /// capacity right now.
    pub async fn acquire(&self) -> Option<Lease> {
        match self.try_acquire().await {
            TryAcquire::Leased(lease) => Some(lease),
            TryAcquire::Busy | TryAcquire::Exhausted => None,
        }
    }

    /// Take a lease, waiting up to `wait` for one held elsewhere to come back
    ///
    /// Returns `None` straight away when no identity can serve any more
    /// downloads, so exhaustion ends a run instead of hanging it.
    pub async fn acquire_wait(&self, wait: Duration) -> Option<Lease> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_acquire().await {
                TryAcquire::Leased(lease) => return Some(lease),
                TryAcquire::Exhausted => return None,
                TryAcquire::Busy => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::debug!(wait_ms = wait.as_millis() as u64, "timed out waiting for an identity");
                return None;
            }
        }
    }

    async fn try_acquire(&self) -> TryAcquire {
        let today = self.clock.today();
        let mut state = self.state.lock().await;
        state.roll_over(today);

        let len = state.identities.len();
        if len == 0 {
            return TryAcquire::Exhausted;
        }

        let active = state.active;
        let chosen = (0..len)
            .map(|offset| (active + offset) % len)
            .find(|&i| state.identities[i].has_capacity());

        match chosen {
            Some(index) => {
                if index != active && !state.identities[active].serviceable() {
                    if let Some(rotation) = state.advance("quota reached".to_string()) {
                        tracing::info!(from = %rotation.from, to = ?rotation.to, "active identity changed");
                    }
                }
                let identity = &mut state.identities[index];
                identity.in_flight += 1;
                tracing::debug!(
                    identity = %identity.identity.id,
                    usage = identity.usage,
                    in_flight = identity.in_flight,
                    "identity leased"
                );
                TryAcquire::Leased(Lease {
                    index,
                    identity: Arc::clone(&identity.identity),
                })
            }
            None if state.may_free_up() => TryAcquire::Busy,
            None => TryAcquire::Exhausted,
        }
    }

    /// Wait until the identity may issue its next request
    ///
    /// Each call books the following slot, so workers sharing an identity are
    /// spaced by the request delay while different identities run freely.
    pub async fn pace(&self, lease: &Lease) {
        if self.request_delay.is_zero() {
            return;
        }

        let wait_until = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let identity = &mut state.identities[lease.index];
            let slot = identity.next_request_at.map_or(now, |at| at.max(now));
            identity.next_request_at = Some(slot + self.request_delay);
            slot
        };

        tokio::time::sleep_until(wait_until).await;
    }

    /// Return a lease with the outcome of its attempt
    ///
    /// Returns the rotation of the active identity this caused, if any.
    pub async fn release(&self, lease: Lease, outcome: AttemptOutcome) -> Option<Rotation> {
        let rotation = {
            let mut state = self.state.lock().await;
            let index = lease.index;
            let is_active = index == state.active;
            let threshold = self.rotation.failure_threshold;

            let identity = &mut state.identities[index];
            identity.in_flight = identity.in_flight.saturating_sub(1);

            match outcome {
                AttemptOutcome::Success => {
                    identity.usage = identity.usage.saturating_add(1);
                    identity.consecutive_failures = 0;
                    let exhausted = identity.usage >= identity.quota();

                    if is_active {
                        state.successes_on_active += 1;
                        let rotate_every = self.rotation.rotate_after_downloads.unwrap_or(0);
                        if exhausted {
                            state.advance("quota reached".to_string())
                        } else if rotate_every > 0 && state.successes_on_active >= rotate_every {
                            state.advance(format!("rotating after {} downloads", rotate_every))
                        } else {
                            None
                        }
                    } else {
                        None
                    }
                }
                AttemptOutcome::Failure => {
                    identity.consecutive_failures += 1;
                    let streak = identity.consecutive_failures;
                    if streak >= threshold && !identity.rotated_out {
                        identity.rotated_out = true;
                        tracing::warn!(
                            identity = %identity.identity.id,
                            consecutive_failures = streak,
                            "identity rotated out after repeated failures"
                        );
                        if is_active {
                            state.advance(format!("{} consecutive failures", streak))
                        } else {
                            None
                        }
                    } else {
                        None
                    }
                }
                AttemptOutcome::ItemFault | AttemptOutcome::Unused => None,
                AttemptOutcome::QuotaExhausted => {
                    identity.usage = identity.usage.max(identity.quota());
                    tracing::warn!(identity = %identity.identity.id, "service reports quota exhausted");
                    if is_active {
                        state.advance("quota exhausted by service".to_string())
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(rotation) = &rotation {
            tracing::info!(
                from = %rotation.from,
                to = ?rotation.to.as_ref().map(|id| id.as_str()),
                reason = %rotation.reason,
                "active identity changed"
            );
        }

        self.released.notify_waiters();
        rotation
    }

    /// Whether any identity can still serve downloads today
    ///
    /// `false` when every identity is quota-exhausted or rotated out; this is
    /// the batch's hard stop.
    pub async fn all_available(&self) -> bool {
        let today = self.clock.today();
        let mut state = self.state.lock().await;
        state.roll_over(today);
        state.any_serviceable()
    }

    /// Current counters of every identity
    pub async fn snapshot(&self) -> Vec<IdentitySnapshot> {
        let today = self.clock.today();
        let mut state = self.state.lock().await;
        state.roll_over(today);
        let active = state.active;
        state
            .identities
            .iter()
            .enumerate()
            .map(|(i, s)| IdentitySnapshot {
                id: s.identity.id.clone(),
                usage: s.usage,
                quota: s.quota(),
                in_flight: s.in_flight,
                consecutive_failures: s.consecutive_failures,
                rotated_out: s.rotated_out,
                active: i == active,
            })
            .collect()
    }
}
