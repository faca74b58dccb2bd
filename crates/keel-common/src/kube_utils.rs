//! Kubernetes helpers shared by the provisioning phases

use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Error;

/// Standard Kubernetes condition status value
pub const STATUS_TRUE: &str = "True";

/// Legacy control-plane role label
pub const MASTER_ROLE_LABEL: &str = "node-role.kubernetes.io/master";

/// Current control-plane role label
pub const CONTROL_PLANE_ROLE_LABEL: &str = "node-role.kubernetes.io/control-plane";

/// Check if a node has the Ready condition set to True
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Check if a node carries a control-plane role label
pub fn is_control_plane_node(node: &Node) -> bool {
    node.metadata
        .labels
        .as_ref()
        .map(|l| l.contains_key(MASTER_ROLE_LABEL) || l.contains_key(CONTROL_PLANE_ROLE_LABEL))
        .unwrap_or(false)
}

/// Poll until a condition is met, the timeout elapses, or the caller cancels
///
/// The check runs immediately and then once per `poll_interval`. Check errors
/// are treated as "not yet" and polling continues.
///
/// # Returns
/// `Ok(())` once `check_fn` returns `Ok(true)`, `Error::Timeout` when the
/// window closes first, `Error::Cancelled` when `cancel` fires.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
    operation: &str,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!(operation, "polling condition not yet met"),
            Err(e) => trace!(operation, error = %e, "polling check returned error, retrying"),
        }

        if tokio::time::Instant::now() + poll_interval > deadline {
            return Err(Error::timeout(
                operation,
                format!("condition not met within {:?}", timeout),
            ));
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(operation)),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}
