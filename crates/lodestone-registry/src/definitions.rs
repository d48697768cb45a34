//! Service definition store.
//!
//! Definitions declare which services exist: name, owner, description,
//! version. They are written by the management plane, carry no TTL, and use
//! optimistic concurrency: every update must present the revision it read.

use lodestone_kv::{CreateOutcome, Entry, KvError, KvStore, UpdateOutcome, keys};
use lodestone_types::{Revision, ServiceDefinition, ServiceName};
use thiserror::Error;
use tracing::warn;

/// Errors from definition CRUD.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// Create of a name that is already declared.
    #[error("service definition already exists: {0}")]
    AlreadyExists(ServiceName),

    /// Update or delete with a stale revision.
    #[error("revision conflict on service definition {0}")]
    RevisionConflict(ServiceName),

    /// Update or read of an undeclared name.
    #[error("service definition not found: {0}")]
    NotFound(ServiceName),

    /// Underlying KV failure.
    #[error(transparent)]
    Kv(#[from] KvError),
}

/// Revision-tracked CRUD over `service-definitions.<name>`.
#[derive(Clone)]
pub struct ServiceDefinitions {
    kv: KvStore,
}

impl ServiceDefinitions {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    /// Declares a new service.
    pub async fn create(&self, definition: &ServiceDefinition) -> Result<Revision, DefinitionError> {
        let key = keys::definition(&definition.name);
        match self.kv.create(&key, definition, None).await? {
            CreateOutcome::Created(revision) => Ok(revision),
            CreateOutcome::AlreadyExists => {
                Err(DefinitionError::AlreadyExists(definition.name.clone()))
            }
        }
    }

    /// Reads a definition with its revision.
    pub async fn get(
        &self,
        name: &ServiceName,
    ) -> Result<Option<Entry<ServiceDefinition>>, DefinitionError> {
        let key = keys::definition(name);
        Ok(self.kv.get(&key).await?)
    }

    /// Lists all declared services.
    pub async fn list(&self) -> Result<Vec<Entry<ServiceDefinition>>, DefinitionError> {
        let mut definitions = Vec::new();
        for key in self.kv.list_keys(&keys::all_definitions()).await? {
            match self.kv.get::<ServiceDefinition>(&key).await {
                Ok(Some(entry)) => definitions.push(entry),
                Ok(None) => {}
                Err(KvError::Decode { key, source }) => {
                    warn!(key = %key, error = %source, "dropping unparseable service definition");
                }
                Err(other) => return Err(other.into()),
            }
        }
        Ok(definitions)
    }

    /// Updates a definition, guarded by the revision the caller read.
    pub async fn update(
        &self,
        definition: &ServiceDefinition,
        expected: Revision,
    ) -> Result<Revision, DefinitionError> {
        let key = keys::definition(&definition.name);
        match self.kv.update(&key, definition, expected, None).await? {
            UpdateOutcome::Updated(revision) => Ok(revision),
            UpdateOutcome::Superseded => {
                // Distinguish a concurrent writer from a vanished key.
                if self.kv.get::<ServiceDefinition>(&key).await?.is_some() {
                    Err(DefinitionError::RevisionConflict(definition.name.clone()))
                } else {
                    Err(DefinitionError::NotFound(definition.name.clone()))
                }
            }
        }
    }

    /// Removes a definition. Idempotent.
    pub async fn delete(&self, name: &ServiceName) -> Result<(), DefinitionError> {
        let key = keys::definition(name);
        Ok(self.kv.delete(&key, None).await?)
    }
}
