//! Cluster lookups used while reconciling
//!
//! Reconcilers read everything through [`ClusterLookups`] so the decision
//! logic can run against an in-memory cluster in tests.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Secret};
use kube::{Api, Client};

use super::secrets::get_secret;
use crate::crd::{Backup, Restore};
use crate::error::{not_found_as, Error, Result};

#[async_trait]
pub trait ClusterLookups: Send + Sync {
    /// Current Backup, or None if it is gone
    async fn backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>>;

    /// Current Restore, or None if it is gone
    async fn restore(&self, namespace: &str, name: &str) -> Result<Option<Restore>>;

    async fn claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim>;

    async fn volume(&self, name: &str) -> Result<PersistentVolume>;

    async fn secret(&self, namespace: &str, name: &str) -> Result<Secret>;
}

/// Lookups against the API server
#[derive(Clone)]
pub struct KubeLookups {
    client: Client,
}

impl KubeLookups {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterLookups for KubeLookups {
    async fn backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>> {
        let api: Api<Backup> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn restore(&self, namespace: &str, name: &str) -> Result<Option<Restore>> {
        let api: Api<Restore> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| not_found_as(e, || Error::PvcNotFound(format!("{}/{}", namespace, name))))
    }

    async fn volume(&self, name: &str) -> Result<PersistentVolume> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| not_found_as(e, || Error::PvNotFound(name.to_string())))
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        get_secret(&self.client, name, namespace).await
    }
}
