//! Reconcile one `VirtualPartitionProxy`
//!
//! Each pass is level-triggered: it compares what the cluster holds with
//! what the resource asks for and writes only the difference.
//!
//! ```text
//!   Pending ──► Reconciling ──► Ready ◄──► Degraded
//!      │            ▲  │
//!      ▼            │  ▼
//!    Failed ────────┘ (spec fixed)
//! ```
//!
//! An invalid spec moves the resource to `Failed` without touching any
//! workload. A valid spec applies the Deployment and Service, then reports
//! `Ready` once every desired replica is ready (immediately when suspended).
//! A resource that was `Ready` for its current generation and then lost
//! replicas is `Degraded` rather than back to `Reconciling`.
//!
//! Status also carries the `ConfigValid`, `DeploymentAvailable` and `Ready`
//! conditions. A condition keeps its `lastTransitionTime` until its status
//! flips, so a settled resource produces no status writes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::chrono::{SecondsFormat, Utc};
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use partmux_observability::metrics::{RECONCILE_DURATION, RECONCILIATIONS_TOTAL};

use crate::cluster::ClusterApi;
use crate::crd::{
    condition, Condition, ConditionStatus, Phase, VirtualPartitionProxy,
    VirtualPartitionProxyStatus,
};
use crate::error::{Error, Result};
use crate::resources::{
    build_deployment, build_service, deployment_matches, endpoint, metrics_endpoint,
    ready_replicas, service_matches,
};
use crate::validation::validate;

/// Requeue delay after a successful pass
pub const SUCCESS_REQUEUE: Duration = Duration::from_secs(30);
/// Requeue delay after the spec failed validation
pub const INVALID_REQUEUE: Duration = Duration::from_secs(300);
/// Requeue delay after any other failure
pub const ERROR_REQUEUE: Duration = Duration::from_secs(60);

/// Requeue delay for a pass that failed with `error`
pub fn requeue_after_error(error: &Error) -> Duration {
    if error.is_invalid_config() {
        INVALID_REQUEUE
    } else {
        ERROR_REQUEUE
    }
}

/// Builds conditions against the previous status, keeping transition times
/// of conditions whose status did not change
struct Conditions<'a> {
    previous: &'a [Condition],
    now: String,
    built: Vec<Condition>,
}

impl<'a> Conditions<'a> {
    fn new(previous: &'a [Condition]) -> Self {
        Self {
            previous,
            now: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            built: Vec::with_capacity(3),
        }
    }

    fn set(
        mut self,
        type_: &str,
        status: impl Into<ConditionStatus>,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        let status = status.into();
        let last_transition_time = self
            .previous
            .iter()
            .find(|c| c.type_ == type_ && c.status == status)
            .and_then(|c| c.last_transition_time.clone())
            .unwrap_or_else(|| self.now.clone());
        self.built.push(Condition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: Some(message.into()),
            last_transition_time: Some(last_transition_time),
        });
        self
    }

    fn build(self) -> Vec<Condition> {
        self.built
    }
}

/// What a successful pass concluded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub phase: Phase,
    pub requeue_after: Duration,
}

pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
    default_image: String,
}

impl Reconciler {
    pub fn new(cluster: Arc<dyn ClusterApi>, default_image: impl Into<String>) -> Self {
        Self {
            cluster,
            default_image: default_image.into(),
        }
    }

    /// Run one pass, recording its result and duration
    #[instrument(
        skip(self, proxy),
        fields(name = %proxy.name_any(), namespace = %proxy.namespace().unwrap_or_default())
    )]
    pub async fn reconcile(&self, proxy: &VirtualPartitionProxy) -> Result<ReconcileOutcome> {
        let start = Instant::now();
        let result = self.converge(proxy).await;
        RECONCILE_DURATION.observe(start.elapsed().as_secs_f64());

        let label = match &result {
            Ok(outcome) if outcome.phase == Phase::Failed => "invalid",
            Ok(_) => "success",
            Err(_) => "error",
        };
        RECONCILIATIONS_TOTAL.with_label_values(&[label]).inc();

        match &result {
            Ok(outcome) => debug!(phase = ?outcome.phase, "Reconciled"),
            Err(e) => warn!(error = %e, "Reconcile failed"),
        }
        result
    }

    async fn converge(&self, proxy: &VirtualPartitionProxy) -> Result<ReconcileOutcome> {
        let namespace = proxy
            .namespace()
            .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
        let name = proxy.name_any();
        let current = proxy.status.clone().unwrap_or_default();
        let generation = proxy.metadata.generation;

        let mapping = match validate(&proxy.spec) {
            Ok(mapping) => mapping,
            Err(e) if e.is_invalid_config() => {
                let conditions = Conditions::new(&current.conditions)
                    .set(condition::CONFIG_VALID, false, "InvalidSpec", e.to_string())
                    .set(
                        condition::DEPLOYMENT_AVAILABLE,
                        false,
                        "InvalidSpec",
                        "No workload for an invalid spec",
                    )
                    .set(condition::READY, false, "Failed", "Spec rejected")
                    .build();
                let status = VirtualPartitionProxyStatus {
                    phase: Phase::Failed,
                    ready_replicas: 0,
                    endpoint: None,
                    metrics_endpoint: None,
                    conditions,
                    message: Some(e.to_string()),
                    observed_generation: generation,
                };
                if current.phase != Phase::Failed {
                    warn!(error = %e, "Spec rejected");
                }
                self.write_status(&namespace, &name, &current, status).await?;
                return Ok(ReconcileOutcome {
                    phase: Phase::Failed,
                    requeue_after: INVALID_REQUEUE,
                });
            }
            Err(e) => return Err(e),
        };

        let desired = build_deployment(proxy, &self.default_image)?;
        let deployment = match self.cluster.get_deployment(&namespace, &name).await? {
            Some(observed) if deployment_matches(&observed, &desired) => observed,
            observed => {
                info!(
                    created = observed.is_none(),
                    replicas = desired.spec.as_ref().and_then(|s| s.replicas),
                    "Applying Deployment"
                );
                self.cluster.apply_deployment(&desired).await?
            }
        };

        let desired = build_service(proxy)?;
        let service = match self.cluster.get_service(&namespace, &name).await? {
            Some(observed) if service_matches(&observed, &desired) => observed,
            observed => {
                info!(created = observed.is_none(), "Applying Service");
                self.cluster.apply_service(&desired).await?
            }
        };

        let ready = ready_replicas(&deployment);
        let spec = &proxy.spec;
        let was_ready = matches!(current.phase, Phase::Ready | Phase::Degraded)
            && current.observed_generation == generation;
        let replica_summary = format!("{}/{} replicas ready", ready, spec.replicas);
        let (phase, message) = if spec.suspend {
            (Phase::Ready, "Suspended, scaled to 0 replicas".to_string())
        } else if ready >= spec.replicas {
            (
                Phase::Ready,
                format!(
                    "{}, {} virtual partitions over {} physical",
                    replica_summary,
                    mapping.virtual_partitions(),
                    mapping.physical_partitions()
                ),
            )
        } else if was_ready {
            (Phase::Degraded, replica_summary.clone())
        } else {
            (Phase::Reconciling, replica_summary.clone())
        };

        let (available, available_reason) = if spec.suspend {
            (false, "Suspended")
        } else if ready > 0 {
            (true, "ReplicasAvailable")
        } else {
            (false, "NoReplicasAvailable")
        };
        let conditions = Conditions::new(&current.conditions)
            .set(
                condition::CONFIG_VALID,
                true,
                "Valid",
                format!(
                    "{} virtual partitions over {} physical",
                    mapping.virtual_partitions(),
                    mapping.physical_partitions()
                ),
            )
            .set(
                condition::DEPLOYMENT_AVAILABLE,
                available,
                available_reason,
                replica_summary,
            )
            .set(
                condition::READY,
                phase == Phase::Ready,
                phase_reason(phase, spec.suspend),
                message.clone(),
            )
            .build();

        let status = VirtualPartitionProxyStatus {
            phase,
            ready_replicas: ready,
            endpoint: endpoint(proxy, &service),
            metrics_endpoint: Some(metrics_endpoint(proxy)?),
            conditions,
            message: Some(message),
            observed_generation: generation,
        };
        self.write_status(&namespace, &name, &current, status).await?;

        Ok(ReconcileOutcome {
            phase,
            requeue_after: SUCCESS_REQUEUE,
        })
    }

    async fn write_status(
        &self,
        namespace: &str,
        name: &str,
        current: &VirtualPartitionProxyStatus,
        status: VirtualPartitionProxyStatus,
    ) -> Result<()> {
        if &status == current {
            return Ok(());
        }
        if status.phase != current.phase {
            info!(from = ?current.phase, to = ?status.phase, "Phase changed");
        }
        self.cluster.patch_status(namespace, name, &status).await
    }
}

fn phase_reason(phase: Phase, suspended: bool) -> &'static str {
    match phase {
        Phase::Ready if suspended => "Suspended",
        Phase::Ready => "AllReplicasReady",
        Phase::Degraded => "ReplicasLost",
        Phase::Reconciling => "RollingOut",
        Phase::Pending => "Pending",
        Phase::Failed => "Failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamped(type_: &str, status: ConditionStatus, at: &str) -> Condition {
        Condition {
            type_: type_.to_string(),
            status,
            reason: "Earlier".to_string(),
            message: None,
            last_transition_time: Some(at.to_string()),
        }
    }

    #[test]
    fn test_transition_time_kept_while_status_holds() {
        let previous = vec![
            stamped(condition::CONFIG_VALID, ConditionStatus::True, "2026-01-01T00:00:00Z"),
            stamped(condition::READY, ConditionStatus::False, "2026-01-01T00:00:00Z"),
        ];
        let conditions = Conditions::new(&previous)
            .set(condition::CONFIG_VALID, true, "Valid", "ok")
            .set(condition::READY, true, "AllReplicasReady", "3/3")
            .build();

        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2026-01-01T00:00:00Z")
        );
        assert_eq!(conditions[0].reason, "Valid");
        // Ready flipped, so it is stamped now
        let flipped = conditions[1].last_transition_time.as_deref().unwrap();
        assert_ne!(flipped, "2026-01-01T00:00:00Z");
        assert!(flipped.ends_with('Z'), "{}", flipped);
    }

    #[test]
    fn test_new_condition_is_stamped() {
        let conditions = Conditions::new(&[])
            .set(condition::DEPLOYMENT_AVAILABLE, false, "NoReplicasAvailable", "0/3")
            .build();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, ConditionStatus::False);
        assert!(conditions[0].last_transition_time.is_some());
    }

    #[test]
    fn test_phase_reasons() {
        assert_eq!(phase_reason(Phase::Ready, true), "Suspended");
        assert_eq!(phase_reason(Phase::Ready, false), "AllReplicasReady");
        assert_eq!(phase_reason(Phase::Degraded, false), "ReplicasLost");
    }
}
