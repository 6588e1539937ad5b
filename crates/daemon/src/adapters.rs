// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Adapter registry: named hook/wrapper/notifier binaries that may emit
//! events, with an enable gate on the adapter protocol version.

use std::sync::Arc;

use serde::Deserialize;

use crate::clock::Clock;
use crate::error::ErrorCode;
use crate::model::{Adapter, ADAPTER_PROTOCOL_VERSION};
use crate::storage::Storage;

/// Wire shape for adapter registration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdapterSpec {
    pub name: String,
    pub version: String,
    pub protocol_version: u32,
}

pub struct AdapterRegistry {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl AdapterRegistry {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    pub fn register(&self, spec: AdapterSpec) -> Result<Adapter, (ErrorCode, String)> {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err((ErrorCode::RefInvalid, "name is required".to_owned()));
        }
        let existing = self.storage.get_adapter(name);
        let adapter = Adapter {
            name: name.to_owned(),
            version: spec.version.trim().to_owned(),
            protocol_version: spec.protocol_version,
            enabled: existing.map(|a| a.enabled).unwrap_or(false),
            updated_at: self.clock.now(),
        };
        self.storage.upsert_adapter(adapter.clone());
        Ok(adapter)
    }

    pub fn list(&self, enabled: Option<bool>) -> Vec<Adapter> {
        self.storage
            .list_adapters()
            .into_iter()
            .filter(|a| enabled.is_none_or(|want| a.enabled == want))
            .collect()
    }

    /// Enable an adapter; fails with 412 when the adapter speaks a
    /// different protocol major than the daemon.
    pub fn enable(&self, name: &str) -> Result<Adapter, (ErrorCode, String)> {
        let Some(mut adapter) = self.storage.get_adapter(name) else {
            return Err((ErrorCode::RefNotFound, format!("unknown adapter: {name}")));
        };
        if adapter.protocol_version != ADAPTER_PROTOCOL_VERSION {
            return Err((
                ErrorCode::PreconditionFailed,
                format!(
                    "adapter protocol {} incompatible with daemon protocol {}",
                    adapter.protocol_version, ADAPTER_PROTOCOL_VERSION
                ),
            ));
        }
        adapter.enabled = true;
        adapter.updated_at = self.clock.now();
        self.storage.upsert_adapter(adapter.clone());
        Ok(adapter)
    }

    pub fn disable(&self, name: &str) -> Result<Adapter, (ErrorCode, String)> {
        let Some(mut adapter) = self.storage.get_adapter(name) else {
            return Err((ErrorCode::RefNotFound, format!("unknown adapter: {name}")));
        };
        adapter.enabled = false;
        adapter.updated_at = self.clock.now();
        self.storage.upsert_adapter(adapter.clone());
        Ok(adapter)
    }
}

#[cfg(test)]
#[path = "adapters_tests.rs"]
mod tests;
