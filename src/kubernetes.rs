//! Kubernetes pod backend: leases an exclusive pod via an annotation lock
//!
//! Pod creation and scaling are left to the cluster; the factory only ensures
//! that a pod serves at most one connection at a time. The lock is an
//! annotation guarded by the API server's optimistic concurrency: an update
//! carrying a stale resource version is rejected with a conflict, which is
//! treated as "already claimed".

use crate::backend::{Backend, BackendFactory};
use crate::error::Error;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Annotation key marking a pod as leased to one connection
pub const POD_LOCK_ANNOTATION: &str = "kramergroup.science.vncd.lock";

const POD_LOCK_VALUE: &str = "yes";

/// The subset of pod state the lease protocol needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRecord {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
    pub pod_ip: Option<String>,
    pub resource_version: String,
}

/// Outcome of a guarded annotation write
#[derive(Debug)]
pub enum PodUpdateError {
    /// The resource version went stale; someone else won the race
    Conflict,
    /// The pod no longer exists
    Gone,
    /// Any other API failure
    Api(String),
}

/// Pod store operations the lease protocol runs against.
///
/// `annotate` must be a compare-and-swap: it applies only when the pod's
/// current resource version equals `resource_version`, and reports
/// [`PodUpdateError::Conflict`] otherwise. A `value` of `None` removes the key.
#[async_trait]
pub trait PodApi: Send + Sync {
    async fn list(&self, label_selector: &str) -> Result<Vec<PodRecord>, Error>;
    async fn get(&self, name: &str) -> Result<PodRecord, Error>;
    async fn annotate(
        &self,
        name: &str,
        resource_version: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), PodUpdateError>;
}

/// Produces a fresh [`KubernetesBackend`] per connection
pub struct KubernetesFactory {
    api: Arc<dyn PodApi>,
    namespace: String,
    label_selector: String,
    container_port: u16,
}

impl KubernetesFactory {
    pub fn new(
        api: Arc<dyn PodApi>,
        namespace: &str,
        label_selector: String,
        container_port: u16,
    ) -> Self {
        Self {
            api,
            namespace: namespace.to_string(),
            label_selector,
            container_port,
        }
    }
}

#[async_trait]
impl BackendFactory for KubernetesFactory {
    async fn create(&self) -> Result<Box<dyn Backend>, Error> {
        info!(
            label_selector = %self.label_selector,
            namespace = %self.namespace,
            "Claiming Kubernetes pod"
        );
        let backend = KubernetesBackend::claim(
            Arc::clone(&self.api),
            &self.namespace,
            &self.label_selector,
            self.container_port,
        )
        .await
        .map_err(|e| match e {
            Error::NoBackendAvailable => Error::NoBackendAvailable,
            other => {
                warn!(namespace = %self.namespace, error = %other, "Pod claim failed");
                Error::BackendUnavailable(other.to_string())
            }
        })?;
        Ok(Box::new(backend))
    }
}

/// A leased pod handling one client stream
pub struct KubernetesBackend {
    api: Arc<dyn PodApi>,
    pod_name: String,
    namespace: String,
    container_port: u16,
}

impl KubernetesBackend {
    /// Scan the namespace for an unlocked pod and lease the first one whose
    /// annotation write is accepted. A conflict means another proxy got
    /// there first; the scan moves on. No claimable pod at all yields
    /// [`Error::NoBackendAvailable`].
    pub async fn claim(
        api: Arc<dyn PodApi>,
        namespace: &str,
        label_selector: &str,
        container_port: u16,
    ) -> Result<KubernetesBackend, Error> {
        let pods = api.list(label_selector).await?;

        for pod in pods {
            if pod.annotations.contains_key(POD_LOCK_ANNOTATION) {
                continue;
            }
            match api
                .annotate(
                    &pod.name,
                    &pod.resource_version,
                    POD_LOCK_ANNOTATION,
                    Some(POD_LOCK_VALUE),
                )
                .await
            {
                Ok(()) => {
                    info!(pod = %pod.name, namespace, "Claimed pod");
                    return Ok(KubernetesBackend {
                        api,
                        pod_name: pod.name,
                        namespace: namespace.to_string(),
                        container_port,
                    });
                }
                Err(PodUpdateError::Conflict) => {
                    let lost = Error::PodClaimConflict {
                        pod: pod.name.clone(),
                    };
                    debug!(error = %lost, "Moving on to next pod");
                    continue;
                }
                Err(PodUpdateError::Gone) => {
                    debug!(pod = %pod.name, "Pod vanished during claim, moving on");
                    continue;
                }
                Err(PodUpdateError::Api(reason)) => {
                    return Err(Error::EngineUnavailable(format!(
                        "locking pod {}: {}",
                        pod.name, reason
                    )));
                }
            }
        }

        Err(Error::NoBackendAvailable)
    }
}

#[async_trait]
impl Backend for KubernetesBackend {
    fn id(&self) -> &str {
        &self.pod_name
    }

    async fn target(&self) -> Result<SocketAddr, Error> {
        let pod = self.api.get(&self.pod_name).await?;
        let raw = pod
            .pod_ip
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                Error::TargetUnresolvable(format!("pod {} has no IP yet", self.pod_name))
            })?;
        let ip = raw.parse().map_err(|_| {
            Error::TargetUnresolvable(format!("pod {} has invalid IP '{}'", self.pod_name, raw))
        })?;
        Ok(SocketAddr::new(ip, self.container_port))
    }

    async fn terminate(&self) {
        let pod = match self.api.get(&self.pod_name).await {
            Ok(pod) => pod,
            Err(e) => {
                warn!(
                    pod = %self.pod_name,
                    namespace = %self.namespace,
                    error = %e,
                    "Cannot release pod lock"
                );
                return;
            }
        };

        if !pod.annotations.contains_key(POD_LOCK_ANNOTATION) {
            debug!(pod = %self.pod_name, "Pod lock already released");
            return;
        }

        // A failed unlock leaks the lease for an operator to clear; retrying
        // here would amplify API load.
        match self
            .api
            .annotate(&pod.name, &pod.resource_version, POD_LOCK_ANNOTATION, None)
            .await
        {
            Ok(()) => info!(pod = %self.pod_name, namespace = %self.namespace, "Released pod lock"),
            Err(e) => warn!(
                pod = %self.pod_name,
                namespace = %self.namespace,
                error = ?e,
                "Failed to release pod lock"
            ),
        }
    }
}

/// [`PodApi`] backed by a real cluster
pub struct KubePodApi {
    pods: Api<Pod>,
}

impl KubePodApi {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl PodApi for KubePodApi {
    async fn list(&self, label_selector: &str) -> Result<Vec<PodRecord>, Error> {
        let params = ListParams::default().labels(label_selector);
        let pods = self
            .pods
            .list(&params)
            .await
            .map_err(|e| Error::EngineUnavailable(format!("pod list: {}", e)))?;
        Ok(pods.items.iter().map(record_from_pod).collect())
    }

    async fn get(&self, name: &str) -> Result<PodRecord, Error> {
        match self.pods.get(name).await {
            Ok(pod) => Ok(record_from_pod(&pod)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(Error::BackendGone {
                id: name.to_string(),
            }),
            Err(e) => Err(Error::EngineUnavailable(format!("pod get: {}", e))),
        }
    }

    async fn annotate(
        &self,
        name: &str,
        resource_version: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), PodUpdateError> {
        // Carrying the observed resourceVersion in the patch makes the API
        // server reject the write with 409 if the pod changed since the read.
        // A null value removes the annotation under merge-patch semantics.
        let mut annotations = serde_json::Map::new();
        annotations.insert(
            key.to_string(),
            match value {
                Some(v) => serde_json::Value::String(v.to_string()),
                None => serde_json::Value::Null,
            },
        );
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": resource_version,
                "annotations": annotations,
            }
        });

        match self
            .pods
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(PodUpdateError::Conflict),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(PodUpdateError::Gone),
            Err(e) => Err(PodUpdateError::Api(e.to_string())),
        }
    }
}

fn record_from_pod(pod: &Pod) -> PodRecord {
    PodRecord {
        name: pod.metadata.name.clone().unwrap_or_default(),
        annotations: pod.metadata.annotations.clone().unwrap_or_default(),
        pod_ip: pod.status.as_ref().and_then(|s| s.pod_ip.clone()),
        resource_version: pod.metadata.resource_version.clone().unwrap_or_default(),
    }
}

/// Build a cluster client from a kubeconfig path, or infer in-cluster or
/// default configuration when none is given
pub async fn kube_client(kubeconfig: Option<&str>) -> Result<Client, Error> {
    let config = match kubeconfig {
        Some(path) if !path.is_empty() => {
            let kc = kube::config::Kubeconfig::read_from(path)
                .map_err(|e| Error::ConfigInvalid(format!("kubeconfig {}: {}", path, e)))?;
            kube::Config::from_custom_kubeconfig(kc, &kube::config::KubeConfigOptions::default())
                .await
                .map_err(|e| Error::ConfigInvalid(format!("kubeconfig {}: {}", path, e)))?
        }
        _ => kube::Config::infer()
            .await
            .map_err(|e| Error::EngineUnavailable(format!("kubernetes config: {}", e)))?,
    };

    Client::try_from(config)
        .map_err(|e| Error::EngineUnavailable(format!("kubernetes client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    /// In-memory pod store with compare-and-swap resource versions
    struct MemoryPodApi {
        pods: Mutex<BTreeMap<String, PodRecord>>,
    }

    impl MemoryPodApi {
        fn with_pods(names: &[&str]) -> Arc<Self> {
            let pods = names
                .iter()
                .map(|name| {
                    (
                        name.to_string(),
                        PodRecord {
                            name: name.to_string(),
                            annotations: BTreeMap::new(),
                            pod_ip: Some("10.1.0.7".to_string()),
                            resource_version: "1".to_string(),
                        },
                    )
                })
                .collect();
            Arc::new(Self {
                pods: Mutex::new(pods),
            })
        }

        async fn locked_pods(&self) -> Vec<String> {
            self.pods
                .lock()
                .await
                .values()
                .filter(|p| p.annotations.contains_key(POD_LOCK_ANNOTATION))
                .map(|p| p.name.clone())
                .collect()
        }
    }

    #[async_trait]
    impl PodApi for MemoryPodApi {
        async fn list(&self, _label_selector: &str) -> Result<Vec<PodRecord>, Error> {
            Ok(self.pods.lock().await.values().cloned().collect())
        }

        async fn get(&self, name: &str) -> Result<PodRecord, Error> {
            self.pods
                .lock()
                .await
                .get(name)
                .cloned()
                .ok_or_else(|| Error::BackendGone {
                    id: name.to_string(),
                })
        }

        async fn annotate(
            &self,
            name: &str,
            resource_version: &str,
            key: &str,
            value: Option<&str>,
        ) -> Result<(), PodUpdateError> {
            let mut pods = self.pods.lock().await;
            let pod = pods.get_mut(name).ok_or(PodUpdateError::Gone)?;
            if pod.resource_version != resource_version {
                return Err(PodUpdateError::Conflict);
            }
            match value {
                Some(v) => {
                    pod.annotations.insert(key.to_string(), v.to_string());
                }
                None => {
                    pod.annotations.remove(key);
                }
            }
            let next: u64 = pod.resource_version.parse().unwrap_or(0) + 1;
            pod.resource_version = next.to_string();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_claim_locks_first_free_pod() {
        let api = MemoryPodApi::with_pods(&["w-0", "w-1"]);
        let backend = KubernetesBackend::claim(api.clone(), "default", "role=w", 5900)
            .await
            .unwrap();

        assert_eq!(backend.id(), "w-0");
        assert_eq!(api.locked_pods().await, vec!["w-0".to_string()]);
    }

    #[tokio::test]
    async fn test_claim_skips_locked_pods() {
        let api = MemoryPodApi::with_pods(&["w-0", "w-1"]);
        api.pods
            .lock()
            .await
            .get_mut("w-0")
            .unwrap()
            .annotations
            .insert(POD_LOCK_ANNOTATION.to_string(), POD_LOCK_VALUE.to_string());

        let backend = KubernetesBackend::claim(api.clone(), "default", "role=w", 5900)
            .await
            .unwrap();
        assert_eq!(backend.id(), "w-1");
    }

    #[tokio::test]
    async fn test_claim_exhausted_namespace() {
        let api = MemoryPodApi::with_pods(&["w-0"]);
        let first = KubernetesBackend::claim(api.clone(), "default", "role=w", 5900)
            .await
            .unwrap();
        let second = KubernetesBackend::claim(api.clone(), "default", "role=w", 5900).await;

        assert!(matches!(second, Err(Error::NoBackendAvailable)));
        drop(first);
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        // Four claimers race for three pods: exactly three win and no pod
        // is leased twice.
        let api = MemoryPodApi::with_pods(&["w-0", "w-1", "w-2"]);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let api = api.clone();
            handles.push(tokio::spawn(async move {
                KubernetesBackend::claim(api, "default", "role=w", 5900).await
            }));
        }

        let mut claimed = Vec::new();
        let mut exhausted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(backend) => claimed.push(backend.id().to_string()),
                Err(Error::NoBackendAvailable) => exhausted += 1,
                Err(other) => panic!("unexpected claim error: {}", other),
            }
        }

        assert_eq!(claimed.len(), 3);
        assert_eq!(exhausted, 1);
        claimed.sort();
        claimed.dedup();
        assert_eq!(claimed.len(), 3, "a pod was leased twice");
        assert_eq!(api.locked_pods().await.len(), 3);
    }

    #[tokio::test]
    async fn test_target_resolves_pod_ip() {
        let api = MemoryPodApi::with_pods(&["w-0"]);
        let backend = KubernetesBackend::claim(api, "default", "role=w", 5901)
            .await
            .unwrap();

        let target = backend.target().await.unwrap();
        assert_eq!(target, "10.1.0.7:5901".parse().unwrap());
    }

    #[tokio::test]
    async fn test_target_of_deleted_pod_is_gone() {
        let api = MemoryPodApi::with_pods(&["w-0"]);
        let backend = KubernetesBackend::claim(api.clone(), "default", "role=w", 5900)
            .await
            .unwrap();

        api.pods.lock().await.remove("w-0");
        assert!(matches!(
            backend.target().await,
            Err(Error::BackendGone { .. })
        ));
    }

    #[tokio::test]
    async fn test_terminate_releases_lock_once() {
        let api = MemoryPodApi::with_pods(&["w-0"]);
        let backend = KubernetesBackend::claim(api.clone(), "default", "role=w", 5900)
            .await
            .unwrap();
        assert_eq!(api.locked_pods().await.len(), 1);

        backend.terminate().await;
        assert!(api.locked_pods().await.is_empty());
        let version_after_unlock = api.get("w-0").await.unwrap().resource_version;

        // A second terminate finds no lock and writes nothing.
        backend.terminate().await;
        assert_eq!(
            api.get("w-0").await.unwrap().resource_version,
            version_after_unlock
        );
    }

    #[tokio::test]
    async fn test_terminate_of_deleted_pod_is_tolerated() {
        let api = MemoryPodApi::with_pods(&["w-0"]);
        let backend = KubernetesBackend::claim(api.clone(), "default", "role=w", 5900)
            .await
            .unwrap();

        api.pods.lock().await.remove("w-0");
        backend.terminate().await;
    }
}
