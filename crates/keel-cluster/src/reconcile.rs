//! Idempotent "ensure present" upsert
//!
//! Safe to call repeatedly and concurrently for different objects. Two
//! concurrent calls for the same object race; the loser sees
//! `Error::Conflict` and must be retried by the caller.

use tracing::{debug, info};

use keel_common::Error;

use crate::store::{ManagedObject, ObjectStore};

/// What [`ensure_present`] did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The object did not exist and was created
    Created,
    /// The live object diverged and was replaced
    Updated,
    /// The live object already matched
    Unchanged,
}

/// Create the object if absent, update it if divergent, otherwise do nothing
pub async fn ensure_present(
    store: &dyn ObjectStore,
    desired: &ManagedObject,
) -> Result<ReconcileOutcome, Error> {
    let desired = desired.clone().with_spec_hash()?;
    let key = desired.key();

    match store.get(&key).await? {
        None => {
            store.create(&desired).await?;
            info!(object = %key, "created");
            Ok(ReconcileOutcome::Created)
        }
        Some(live) if desired.diverges_from(&live) => {
            let mut update = desired;
            update.carry_live_fields(&live);
            store.update(&update).await?;
            info!(object = %key, "updated");
            Ok(ReconcileOutcome::Updated)
        }
        Some(_) => {
            debug!(object = %key, "unchanged");
            Ok(ReconcileOutcome::Unchanged)
        }
    }
}

/// Ensure every object in order, stopping at the first failure
pub async fn ensure_all(
    store: &dyn ObjectStore,
    objects: &[ManagedObject],
) -> Result<Vec<ReconcileOutcome>, Error> {
    let mut outcomes = Vec::with_capacity(objects.len());
    for object in objects {
        outcomes.push(ensure_present(store, object).await?);
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::store::{MemoryStore, MockObjectStore, MutationCounts};

    fn config_map(value: &str) -> ManagedObject {
        ManagedObject::ConfigMap(ConfigMap {
            metadata: ObjectMeta {
                name: Some("audit-policy".to_string()),
                namespace: Some("c1".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("policy.yaml".to_string(), value.to_string())])),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn second_call_with_same_object_is_a_no_op() {
        let store = MemoryStore::new();
        let desired = config_map("level: Metadata");

        assert_eq!(
            ensure_present(&store, &desired).await.unwrap(),
            ReconcileOutcome::Created
        );
        assert_eq!(
            ensure_present(&store, &desired).await.unwrap(),
            ReconcileOutcome::Unchanged
        );
        assert_eq!(
            store.mutations(),
            MutationCounts {
                creates: 1,
                updates: 0,
                node_updates: 0
            }
        );
    }

    #[tokio::test]
    async fn changed_object_is_updated() {
        let store = MemoryStore::new();
        ensure_present(&store, &config_map("a")).await.unwrap();
        assert_eq!(
            ensure_present(&store, &config_map("b")).await.unwrap(),
            ReconcileOutcome::Updated
        );
        assert_eq!(store.mutations().updates, 1);

        match store.object(&config_map("b").key()).unwrap() {
            ManagedObject::ConfigMap(cm) => {
                assert_eq!(cm.data.unwrap()["policy.yaml"], "b");
            }
            other => panic!("unexpected object {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_conflict_is_surfaced() {
        let mut store = MockObjectStore::new();
        store
            .expect_get()
            .returning(|_| Ok(Some(config_map("old"))));
        store.expect_create().never();
        store
            .expect_update()
            .times(1)
            .returning(|o| Err(Error::conflict("ConfigMap", o.name(), "modified")));

        let err = ensure_present(&store, &config_map("new")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn ensure_all_stops_at_first_failure() {
        let mut store = MockObjectStore::new();
        store.expect_get().times(1).returning(|_| Ok(None));
        store
            .expect_create()
            .times(1)
            .returning(|_| Err(Error::internal("apiserver unavailable")));

        let objects = vec![config_map("a"), config_map("b")];
        assert!(ensure_all(&store, &objects).await.is_err());
    }
}
