//! Shared, read-only state handed to every pipeline

use crate::config::KubestrapConfig;
use crate::settings::ClusterSpec;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// Why a wait or backoff stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    /// Operator abort (SIGINT/SIGTERM)
    Cancelled,
    /// Whole-run deadline elapsed
    DeadlineExceeded,
}

impl fmt::Display for Interruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interruption::Cancelled => write!(f, "cancelled by operator"),
            Interruption::DeadlineExceeded => write!(f, "run deadline exceeded"),
        }
    }
}

/// Per-run context: settings, tunables and the cancellation signal
#[derive(Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub spec: Arc<ClusterSpec>,
    pub config: Arc<KubestrapConfig>,
    cancel: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl RunContext {
    pub fn new(
        spec: Arc<ClusterSpec>,
        config: Arc<KubestrapConfig>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let deadline = config.run.deadline().map(|d| Instant::now() + d);
        Self {
            run_id: Uuid::new_v4(),
            spec,
            config,
            cancel,
            deadline,
        }
    }

    /// Context that can never be cancelled (one-shot checks, tests)
    pub fn detached(spec: ClusterSpec, config: KubestrapConfig) -> Self {
        let (tx, rx) = watch::channel(false);
        // Dropping the sender leaves the receiver permanently un-signalled
        drop(tx);
        Self::new(Arc::new(spec), Arc::new(config), rx)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Current interruption state without waiting
    pub fn interruption(&self) -> Option<Interruption> {
        if *self.cancel.borrow() {
            return Some(Interruption::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interruption::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the run is cancelled or the deadline passes; pending
    /// forever otherwise.
    pub async fn interrupted(&self) -> Interruption {
        let mut cancel = self.cancel.clone();
        let cancelled = async move {
            loop {
                if *cancel.borrow_and_update() {
                    return;
                }
                if cancel.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancelled => Interruption::Cancelled,
            _ = deadline => Interruption::DeadlineExceeded,
        }
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("cluster", &self.spec.cluster_name)
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::tests::sample_spec;
    use crate::shutdown::ShutdownCoordinator;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let coordinator = ShutdownCoordinator::new();
        let ctx = RunContext::new(
            Arc::new(sample_spec()),
            Arc::new(KubestrapConfig::default()),
            coordinator.subscribe(),
        );
        assert_eq!(ctx.interruption(), None);

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.interrupted().await })
        };
        coordinator.shutdown();

        assert_eq!(waiter.await.unwrap(), Interruption::Cancelled);
        assert_eq!(ctx.interruption(), Some(Interruption::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires() {
        let ctx = RunContext::detached(sample_spec(), KubestrapConfig::default())
            .with_deadline(Instant::now() + Duration::from_secs(30));

        assert_eq!(ctx.interrupted().await, Interruption::DeadlineExceeded);
        assert_eq!(ctx.interruption(), Some(Interruption::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_never_interrupts() {
        let ctx = RunContext::detached(sample_spec(), KubestrapConfig::default());
        let res = tokio::time::timeout(Duration::from_secs(3600), ctx.interrupted()).await;
        assert!(res.is_err());
    }
}
