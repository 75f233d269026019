//! Endpoint registry and resource index.
//!
//! Two process-local maps: endpoint id to descriptor, and resource id back
//! to endpoint id. Resource ids are opaque nonces minted at publish time;
//! they are deliberately unrelated to the endpoint id they point at.

use crate::endpoint::{Endpoint, EndpointDescriptor};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;

/// Length of resource ids, ETags, and backend transaction ids.
pub const NONCE_LEN: usize = 16;

/// Uniform alphanumeric nonce.
pub fn nonce(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn valid_endpoint_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// In-memory store of endpoints and the resource reverse index.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
    resources: RwLock<HashMap<String, String>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new endpoint. Fails on a syntactically invalid or
    /// duplicate id.
    pub fn create(&self, descriptor: EndpointDescriptor) -> Result<Arc<Endpoint>> {
        if !valid_endpoint_id(&descriptor.id) {
            return Err(Error::InvalidArgument(format!(
                "invalid endpoint id '{}'",
                descriptor.id
            )));
        }
        let mut endpoints = self.endpoints.write();
        if endpoints.contains_key(&descriptor.id) {
            return Err(Error::EndpointExists(descriptor.id));
        }
        let endpoint = Arc::new(Endpoint::new(descriptor));
        endpoints.insert(endpoint.id.clone(), endpoint.clone());
        Ok(endpoint)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }

    /// Remove the endpoint from the registry. The caller is responsible
    /// for tearing down any active session first.
    pub fn remove(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.write().remove(id)
    }

    /// Mint a fresh resource id for the endpoint, retrying until unused.
    pub fn reserve_resource(&self, endpoint_id: &str) -> String {
        let mut resources = self.resources.write();
        loop {
            let resource_id = nonce(NONCE_LEN);
            if !resources.contains_key(&resource_id) {
                resources.insert(resource_id.clone(), endpoint_id.to_string());
                return resource_id;
            }
        }
    }

    pub fn release_resource(&self, resource_id: &str) {
        self.resources.write().remove(resource_id);
    }

    pub fn lookup_by_resource(&self, resource_id: &str) -> Option<Arc<Endpoint>> {
        let endpoint_id = self.resources.read().get(resource_id).cloned()?;
        self.get(&endpoint_id)
    }
}
