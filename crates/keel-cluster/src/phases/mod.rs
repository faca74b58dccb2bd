//! Cluster and machine phase pipelines
//!
//! Each pipeline is an ordered list of idempotent ensure steps. Steps run
//! strictly one after another; the first failure stops the run, is recorded
//! as a `Failure` condition and is returned wrapped in `Error::Phase`.
//! Every step is raced against the context's cancellation token.

mod cluster;
mod machine;

pub use cluster::{
    ensure_ext_kubeconfig, ensure_kubeconfig, ClusterContext, ClusterContextBuilder, ClusterStep,
};
pub use machine::{MachineContext, MachineContextBuilder, MachineStep};

use std::future::Future;
use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use keel_common::conditions::{is_succeeded, set_condition};
use keel_common::crd::{Condition, ConditionStatus};
use keel_common::Error;

/// Random source shared by the steps of one context
///
/// Endpoint selection draws from it; seed it in tests for a fixed choice.
pub struct SharedRng(Mutex<StdRng>);

impl SharedRng {
    /// Seeded from the operating system
    pub fn from_entropy() -> Self {
        Self(Mutex::new(StdRng::from_entropy()))
    }

    /// Deterministic sequence
    pub fn seeded(seed: u64) -> Self {
        Self(Mutex::new(StdRng::seed_from_u64(seed)))
    }

    /// Borrow the generator for one synchronous draw
    pub fn with<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut rng)
    }
}

impl std::fmt::Debug for SharedRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedRng")
    }
}

/// Condition recorded for a step's outcome
pub(crate) fn outcome_condition(step: &str, result: &Result<(), Error>) -> Condition {
    match result {
        Ok(()) => Condition::new(step, ConditionStatus::Success, "Succeeded", ""),
        Err(e) => Condition::new(step, ConditionStatus::Failure, e.kind(), e.to_string()),
    }
}

/// Run one step inside its span, aborting when `cancel` fires
pub(crate) async fn run_step<F>(
    cancel: &CancellationToken,
    step: &'static str,
    target: &str,
    fut: F,
) -> Result<(), Error>
where
    F: Future<Output = Result<(), Error>>,
{
    let span = info_span!("phase", phase = step, target = %target);
    async {
        debug!("phase starting");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::cancelled(step)),
            r = fut => r,
        };
        match &result {
            Ok(()) => info!("phase succeeded"),
            Err(e) => warn!(error = %e, "phase failed"),
        }
        result
    }
    .instrument(span)
    .await
}

/// Whether a step can be skipped on this pass
pub(crate) fn skippable(skip_succeeded: bool, conditions: &[Condition], step: &str) -> bool {
    if skip_succeeded && is_succeeded(conditions, step) {
        debug!(phase = step, "already succeeded, skipping");
        return true;
    }
    false
}

/// Record a step's outcome and turn a failure into `Error::Phase`
pub(crate) fn record_outcome(
    conditions: &mut Vec<Condition>,
    step: &'static str,
    target: &str,
    result: Result<(), Error>,
) -> Result<(), Error> {
    set_condition(conditions, outcome_condition(step, &result));
    result.map_err(|e| e.in_phase(step, target))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn cancelled_step_does_not_finish() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_step(&cancel, "EnsureCerts", "c1", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
    }

    #[test]
    fn failure_is_recorded_and_wrapped() {
        let mut conditions = Vec::new();
        let err = record_outcome(
            &mut conditions,
            "EnsureJoinNode",
            "10.0.0.5",
            Err(Error::remote_command("10.0.0.5", "kubeadm join", 1, "refused")),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Phase { .. }));
        assert_eq!(conditions[0].status, ConditionStatus::Failure);
        assert_eq!(conditions[0].reason, "RemoteCommandError");
        assert!(!skippable(true, &conditions, "EnsureJoinNode"));

        record_outcome(&mut conditions, "EnsureJoinNode", "10.0.0.5", Ok(())).unwrap();
        assert_eq!(conditions.len(), 1);
        assert!(skippable(true, &conditions, "EnsureJoinNode"));
        assert!(!skippable(false, &conditions, "EnsureJoinNode"));
    }

    #[test]
    fn seeded_rng_is_repeatable() {
        use rand::Rng;
        let a = SharedRng::seeded(7).with(|r| r.gen::<u64>());
        let b = SharedRng::seeded(7).with(|r| r.gen::<u64>());
        assert_eq!(a, b);
    }
}
