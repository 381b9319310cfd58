//! Lease-based leader election.
//!
//! Only one replica may publish at a time. A [`LeaderCoordinator`] competes
//! for a cluster-wide lease through a [`LeaseLock`] and reports the outcome
//! through a [`LeaderHandle`]: `wait_promoted` gates publisher startup, and
//! losing the lease cancels the shared run token so the publisher stops
//! before another replica takes over.
//!
//! Cancelling the run token does not give the lease up. The lease is held
//! until [`LeaderHandle::release`] is called, after the publisher has
//! drained, so a standby never starts while this replica is still
//! submitting rows.

pub mod lease;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::LeaderConfig;
use crate::{Error, Result};

pub use lease::KubeLeaseLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    Pending,
    Leading,
    /// Terminal for this process.
    Lost,
}

/// Result of one acquire-or-renew attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseObservation {
    /// Current holder, if the lease is held.
    pub holder: Option<String>,
    /// Whether the caller now holds the lease.
    pub acquired: bool,
}

impl LeaseObservation {
    pub fn acquired(identity: &str) -> Self {
        Self {
            holder: Some(identity.to_string()),
            acquired: true,
        }
    }
}

/// An exclusive, time-bounded lock shared by all replicas.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Takes the lease if it is free or expired, or extends it if
    /// `identity` already holds it.
    async fn try_acquire_or_renew(
        &self,
        identity: &str,
        lease_duration: Duration,
    ) -> Result<LeaseObservation>;

    /// Gives the lease up if `identity` holds it.
    async fn release(&self, identity: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct ElectionTiming {
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl From<&LeaderConfig> for ElectionTiming {
    fn from(config: &LeaderConfig) -> Self {
        Self {
            lease_duration: Duration::from_secs(config.lease_duration_secs),
            renew_deadline: Duration::from_secs(config.renew_deadline_secs),
            retry_period: Duration::from_secs(config.retry_period_secs),
        }
    }
}

pub struct LeaderCoordinator {
    lock: Arc<dyn LeaseLock>,
    identity: String,
    timing: ElectionTiming,
    run: CancellationToken,
    shutdown: CancellationToken,
    state: watch::Sender<LeadershipState>,
    leader: watch::Sender<Option<String>>,
}

/// Observer side of a running [`LeaderCoordinator`].
pub struct LeaderHandle {
    state: watch::Receiver<LeadershipState>,
    leader: watch::Receiver<Option<String>>,
    run: CancellationToken,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl LeaderCoordinator {
    /// `run` is cancelled when leadership is lost. Cancelling it from
    /// outside stops a pending election but keeps a held lease until
    /// [`LeaderHandle::release`].
    pub fn new(
        lock: Arc<dyn LeaseLock>,
        identity: impl Into<String>,
        timing: ElectionTiming,
        run: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(LeadershipState::Pending);
        let (leader, _) = watch::channel(None);
        Self {
            lock,
            identity: identity.into(),
            timing,
            run,
            shutdown: CancellationToken::new(),
            state,
            leader,
        }
    }

    pub fn spawn(self) -> LeaderHandle {
        let state = self.state.subscribe();
        let leader = self.leader.subscribe();
        let run = self.run.clone();
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(self.run_election());
        LeaderHandle {
            state,
            leader,
            run,
            shutdown,
            task,
        }
    }

    async fn run_election(self) {
        info!(identity = %self.identity, "Running leader elector");

        if !self.acquire().await {
            info!(identity = %self.identity, "Leader election cancelled before acquiring lease");
            return;
        }

        self.state.send_replace(LeadershipState::Leading);
        info!(identity = %self.identity, "Started leading");

        if self.hold().await {
            self.state.send_replace(LeadershipState::Lost);
            warn!(identity = %self.identity, "Stopped leading");
            self.run.cancel();
            return;
        }

        match timeout(self.timing.renew_deadline, self.lock.release(&self.identity)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to release lease"),
            Err(_) => warn!("Timed out releasing lease"),
        }
        self.state.send_replace(LeadershipState::Lost);
        info!(identity = %self.identity, "Leadership released on shutdown");
    }

    async fn attempt(&self, deadline: Duration) -> Option<LeaseObservation> {
        match timeout(
            deadline,
            self.lock
                .try_acquire_or_renew(&self.identity, self.timing.lease_duration),
        )
        .await
        {
            Ok(Ok(observation)) => {
                self.observe(&observation);
                Some(observation)
            }
            Ok(Err(e)) => {
                error!(identity = %self.identity, error = %e, "Lease request failed");
                None
            }
            Err(_) => {
                warn!(identity = %self.identity, "Lease request timed out");
                None
            }
        }
    }

    /// Polls until the lease is ours. Returns false if cancelled first.
    async fn acquire(&self) -> bool {
        loop {
            if self.run.is_cancelled() || self.shutdown.is_cancelled() {
                return false;
            }
            if let Some(observation) = self.attempt(self.timing.renew_deadline).await {
                if observation.acquired {
                    return true;
                }
            }
            tokio::select! {
                _ = self.run.cancelled() => return false,
                _ = self.shutdown.cancelled() => return false,
                _ = sleep(self.timing.retry_period) => {}
            }
        }
    }

    /// Renews until released (returns false) or the lease is lost
    /// (returns true). Keeps renewing while the publisher drains.
    async fn hold(&self) -> bool {
        let mut last_renewal = Instant::now();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = sleep(self.timing.retry_period) => {}
            }

            let remaining = self.timing.renew_deadline.saturating_sub(last_renewal.elapsed());
            match self.attempt(remaining).await {
                Some(observation) if observation.acquired => {
                    last_renewal = Instant::now();
                    continue;
                }
                Some(observation) => {
                    warn!(holder = ?observation.holder, "Lease is held by another replica");
                    return true;
                }
                None => {}
            }

            if last_renewal.elapsed() >= self.timing.renew_deadline {
                warn!(
                    deadline = ?self.timing.renew_deadline,
                    "Failed to renew lease within deadline"
                );
                return true;
            }
        }
    }

    fn observe(&self, observation: &LeaseObservation) {
        let changed = self.leader.send_if_modified(|current| {
            if *current != observation.holder {
                *current = observation.holder.clone();
                true
            } else {
                false
            }
        });
        if changed {
            if let Some(identity) = &observation.holder {
                info!(identity = %identity, "New leader");
            }
        }
    }
}

impl LeaderHandle {
    pub fn state(&self) -> LeadershipState {
        *self.state.borrow()
    }

    /// Identity of the replica last seen holding the lease.
    pub fn current_leader(&self) -> Option<String> {
        self.leader.borrow().clone()
    }

    /// Blocks until this replica leads.
    ///
    /// Fails with [`Error::Shutdown`] if the run is cancelled first.
    pub async fn wait_promoted(&mut self) -> Result<()> {
        loop {
            match *self.state.borrow_and_update() {
                LeadershipState::Leading => return Ok(()),
                LeadershipState::Lost => {
                    return Err(Error::Leadership {
                        message: "leadership lost before startup".to_string(),
                    })
                }
                LeadershipState::Pending => {}
            }

            tokio::select! {
                changed = self.state.changed() => {
                    if changed.is_err() && self.state() == LeadershipState::Pending {
                        return Err(Error::Shutdown);
                    }
                }
                _ = self.run.cancelled() => return Err(Error::Shutdown),
            }
        }
    }

    /// Stops the election and gives the lease up if it is held.
    ///
    /// Call this once the publisher has stopped.
    pub async fn release(self) {
        self.shutdown.cancel();
        self.join().await;
    }

    /// Waits for the election task to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(error = %e, "Leader election task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Held {
        holder: Option<String>,
        expires: Option<Instant>,
    }

    /// In-process lease with real expiry, shared by test candidates.
    #[derive(Default)]
    struct MemoryLease {
        held: Mutex<Held>,
        unreachable: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl LeaseLock for MemoryLease {
        async fn try_acquire_or_renew(
            &self,
            identity: &str,
            lease_duration: Duration,
        ) -> Result<LeaseObservation> {
            if self.unreachable.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::Leadership {
                    message: "api server unreachable".to_string(),
                });
            }
            let mut held = self.held.lock().unwrap();
            let now = Instant::now();
            let free = match (&held.holder, held.expires) {
                (None, _) => true,
                (Some(h), _) if h == identity => true,
                (Some(_), Some(expires)) => expires < now,
                (Some(_), None) => true,
            };
            if free {
                held.holder = Some(identity.to_string());
                held.expires = Some(now + lease_duration);
                Ok(LeaseObservation::acquired(identity))
            } else {
                Ok(LeaseObservation {
                    holder: held.holder.clone(),
                    acquired: false,
                })
            }
        }

        async fn release(&self, identity: &str) -> Result<()> {
            let mut held = self.held.lock().unwrap();
            if held.holder.as_deref() == Some(identity) {
                *held = Held::default();
            }
            Ok(())
        }
    }

    fn timing() -> ElectionTiming {
        ElectionTiming {
            lease_duration: Duration::from_millis(400),
            renew_deadline: Duration::from_millis(200),
            retry_period: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_single_candidate_is_promoted() {
        let lock = Arc::new(MemoryLease::default());
        let run = CancellationToken::new();
        let mut handle = LeaderCoordinator::new(lock, "replica-a", timing(), run.clone()).spawn();

        tokio::time::timeout(Duration::from_secs(2), handle.wait_promoted())
            .await
            .expect("promotion timed out")
            .unwrap();
        assert_eq!(handle.state(), LeadershipState::Leading);
        assert_eq!(handle.current_leader().as_deref(), Some("replica-a"));

        handle.release().await;
    }

    #[tokio::test]
    async fn test_only_one_replica_leads() {
        let lock = Arc::new(MemoryLease::default());
        let run_a = CancellationToken::new();
        let run_b = CancellationToken::new();

        let mut a = LeaderCoordinator::new(lock.clone(), "replica-a", timing(), run_a.clone())
            .spawn();
        a.wait_promoted().await.unwrap();

        let mut b = LeaderCoordinator::new(lock.clone(), "replica-b", timing(), run_b.clone())
            .spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(b.state(), LeadershipState::Pending);
        assert_eq!(b.current_leader().as_deref(), Some("replica-a"));

        // Releasing the leader's lease lets the standby in.
        run_a.cancel();
        a.release().await;

        tokio::time::timeout(Duration::from_secs(2), b.wait_promoted())
            .await
            .expect("standby was not promoted")
            .unwrap();
        assert_eq!(b.current_leader().as_deref(), Some("replica-b"));

        b.release().await;
    }

    #[tokio::test]
    async fn test_lease_held_until_released_after_drain() {
        let lock = Arc::new(MemoryLease::default());
        let run_a = CancellationToken::new();
        let run_b = CancellationToken::new();

        let mut a = LeaderCoordinator::new(lock.clone(), "replica-a", timing(), run_a.clone())
            .spawn();
        a.wait_promoted().await.unwrap();
        let mut b = LeaderCoordinator::new(lock.clone(), "replica-b", timing(), run_b.clone())
            .spawn();

        // A shutdown signal cancels the run while the publisher drains.
        run_a.cancel();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(a.state(), LeadershipState::Leading);
        assert_eq!(b.state(), LeadershipState::Pending);
        assert_eq!(
            lock.held.lock().unwrap().holder.as_deref(),
            Some("replica-a")
        );

        a.release().await;
        tokio::time::timeout(Duration::from_secs(2), b.wait_promoted())
            .await
            .expect("standby was not promoted after release")
            .unwrap();

        b.release().await;
    }

    #[tokio::test]
    async fn test_renewal_failure_cancels_run() {
        let lock = Arc::new(MemoryLease::default());
        let run = CancellationToken::new();
        let mut handle =
            LeaderCoordinator::new(lock.clone(), "replica-a", timing(), run.clone()).spawn();
        handle.wait_promoted().await.unwrap();

        lock.unreachable
            .store(true, std::sync::atomic::Ordering::SeqCst);

        tokio::time::timeout(Duration::from_secs(2), run.cancelled())
            .await
            .expect("run was not cancelled after losing the lease");
        handle.join().await;
    }

    #[tokio::test]
    async fn test_takeover_by_other_holder_is_loss() {
        let lock = Arc::new(MemoryLease::default());
        let run = CancellationToken::new();
        let mut handle =
            LeaderCoordinator::new(lock.clone(), "replica-a", timing(), run.clone()).spawn();
        handle.wait_promoted().await.unwrap();

        {
            let mut held = lock.held.lock().unwrap();
            held.holder = Some("replica-b".to_string());
            held.expires = Some(Instant::now() + Duration::from_secs(60));
        }

        tokio::time::timeout(Duration::from_secs(2), run.cancelled())
            .await
            .expect("run was not cancelled after takeover");
        handle.join().await;
    }

    #[tokio::test]
    async fn test_cancel_while_pending() {
        let lock = Arc::new(MemoryLease::default());
        lock.try_acquire_or_renew("replica-a", Duration::from_secs(60))
            .await
            .unwrap();

        let run = CancellationToken::new();
        let mut handle = LeaderCoordinator::new(lock, "replica-b", timing(), run.clone()).spawn();

        let canceller = run.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = handle.wait_promoted().await.unwrap_err();
        assert!(matches!(err, Error::Shutdown));
        assert_eq!(handle.state(), LeadershipState::Pending);
        handle.join().await;
    }
}
