//! Job definition registry.
//!
//! Built once at startup, then shared as `Arc<JobRegistry>`. There is no
//! interior mutability: lookups after startup never take a lock.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::JobError;
use crate::worker::definition::{JobDefinition, JobHandler, JobOptions};

/// Catalog of registered job definitions, in registration order.
#[derive(Debug, Default)]
pub struct JobRegistry {
    definitions: Vec<Arc<JobDefinition>>,
    by_name: HashMap<String, usize>,
}

impl JobRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job. Duplicate or blank names are rejected; callers are
    /// expected to propagate the error and abort startup.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        options: JobOptions,
    ) -> Result<Arc<JobDefinition>, JobError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(JobError::InvalidName(name));
        }
        if self.by_name.contains_key(&name) {
            return Err(JobError::AlreadyRegistered { name });
        }

        let definition = Arc::new(JobDefinition::new(name.clone(), handler, options));
        self.by_name.insert(name.clone(), self.definitions.len());
        self.definitions.push(Arc::clone(&definition));
        tracing::debug!(job = %name, "Registered job");
        Ok(definition)
    }

    /// Get a definition by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<JobDefinition>> {
        self.by_name
            .get(name)
            .map(|&idx| Arc::clone(&self.definitions[idx]))
    }

    /// All definitions, in registration order.
    pub fn definitions(&self) -> Vec<Arc<JobDefinition>> {
        self.definitions.clone()
    }

    /// All registered names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.definitions.iter().map(|d| d.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
