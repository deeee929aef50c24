//! Stable-id registry of endpoints, persisted as `endpoints.json`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context};
use dicebot_core::write_text_atomic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::endpoint_bootstrap::EndpointBootstrapError;
use crate::endpoint_state::{lock_or_recover, EndpointHandle, EndpointProfile};

pub const ENDPOINT_REGISTRY_FILE_NAME: &str = "endpoints.json";
const ENDPOINT_REGISTRY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
/// Enumerates supported `EndpointRegistryError` values.
pub enum EndpointRegistryError {
    #[error("unknown endpoint '{0}'")]
    UnknownEndpoint(String),
    #[error("endpoint '{0}' is already registered")]
    DuplicateEndpoint(String),
    #[error("invalid endpoint registration: {0}")]
    InvalidRegistration(String),
    #[error("endpoint '{0}' has no live message session")]
    NotConnected(String),
    #[error(transparent)]
    Credentials(#[from] EndpointBootstrapError),
    #[error("message session action failed: {0:#}")]
    Session(anyhow::Error),
    #[error("endpoint registry persistence failed: {0:#}")]
    Persistence(anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EndpointRegistryFile {
    #[serde(default = "endpoint_registry_schema_version")]
    schema_version: u32,
    #[serde(default)]
    endpoints: Vec<EndpointProfile>,
}

fn endpoint_registry_schema_version() -> u32 {
    ENDPOINT_REGISTRY_SCHEMA_VERSION
}

#[derive(Debug, Default)]
/// Endpoints in registration order, addressed by id.
pub struct EndpointRegistry {
    state_path: Option<PathBuf>,
    endpoints: Mutex<Vec<EndpointHandle>>,
    persist_guard: Mutex<()>,
}

impl EndpointRegistry {
    /// Registry that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads `path`, or starts empty when it does not exist yet.
    pub fn load(path: &Path) -> Result<Self, EndpointRegistryError> {
        let profiles = load_endpoint_profiles(path).map_err(EndpointRegistryError::Persistence)?;
        Ok(Self {
            state_path: Some(path.to_path_buf()),
            endpoints: Mutex::new(profiles.into_iter().map(EndpointHandle::new).collect()),
            persist_guard: Mutex::new(()),
        })
    }

    pub fn state_path(&self) -> Option<&Path> {
        self.state_path.as_deref()
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.endpoints).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<EndpointHandle> {
        lock_or_recover(&self.endpoints).clone()
    }

    pub fn get(&self, id: &str) -> Result<EndpointHandle, EndpointRegistryError> {
        lock_or_recover(&self.endpoints)
            .iter()
            .find(|handle| handle.id() == id)
            .cloned()
            .ok_or_else(|| EndpointRegistryError::UnknownEndpoint(id.to_string()))
    }

    pub fn find_by_account(&self, account_id: &str) -> Option<EndpointHandle> {
        lock_or_recover(&self.endpoints)
            .iter()
            .find(|handle| handle.read(|record| record.profile.account_id == account_id))
            .cloned()
    }

    pub fn insert(&self, profile: EndpointProfile) -> Result<EndpointHandle, EndpointRegistryError> {
        let handle = EndpointHandle::new(profile);
        {
            let mut endpoints = lock_or_recover(&self.endpoints);
            if endpoints.iter().any(|existing| existing.id() == handle.id()) {
                return Err(EndpointRegistryError::DuplicateEndpoint(
                    handle.id().to_string(),
                ));
            }
            endpoints.push(handle.clone());
        }
        self.persist()?;
        Ok(handle)
    }

    pub fn remove(&self, id: &str) -> Result<EndpointHandle, EndpointRegistryError> {
        let removed = {
            let mut endpoints = lock_or_recover(&self.endpoints);
            let position = endpoints
                .iter()
                .position(|handle| handle.id() == id)
                .ok_or_else(|| EndpointRegistryError::UnknownEndpoint(id.to_string()))?;
            endpoints.remove(position)
        };
        self.persist()?;
        Ok(removed)
    }

    /// Writes every endpoint's durable profile. No-op for in-memory registries.
    pub fn persist(&self) -> Result<(), EndpointRegistryError> {
        let Some(path) = self.state_path.as_deref() else {
            return Ok(());
        };
        let _persisting = lock_or_recover(&self.persist_guard);
        let file = EndpointRegistryFile {
            schema_version: ENDPOINT_REGISTRY_SCHEMA_VERSION,
            endpoints: self.handles().iter().map(EndpointHandle::profile).collect(),
        };
        save_endpoint_registry(path, &file).map_err(EndpointRegistryError::Persistence)
    }
}

fn load_endpoint_profiles(path: &Path) -> anyhow::Result<Vec<EndpointProfile>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parsed: EndpointRegistryFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse endpoint registry {}", path.display()))?;
    if parsed.schema_version != ENDPOINT_REGISTRY_SCHEMA_VERSION {
        bail!(
            "unsupported endpoint registry schema {} in {}",
            parsed.schema_version,
            path.display()
        );
    }
    Ok(parsed.endpoints)
}

fn save_endpoint_registry(path: &Path, file: &EndpointRegistryFile) -> anyhow::Result<()> {
    let payload =
        serde_json::to_string_pretty(file).context("failed to serialize endpoint registry")?;
    write_text_atomic(path, &payload).with_context(|| format!("failed to write {}", path.display()))
}
