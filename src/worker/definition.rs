//! Job definitions — a named handler plus its argument shape and options.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::worker::instance::JobInstance;

/// The unit of work behind a job definition.
///
/// `cancel` is triggered when a kill request is observed while the handler
/// runs. Handlers are expected to check it in any loop and return `Ok(())`
/// promptly once it fires; cancellation is not a failure.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, cancel: CancellationToken, job: JobInstance) -> anyhow::Result<()>;
}

/// Adapter that lets a plain async closure act as a [`JobHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(CancellationToken, JobInstance) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, cancel: CancellationToken, job: JobInstance) -> anyhow::Result<()> {
        (self.0)(cancel, job).await
    }
}

/// Wrap an async closure into a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(CancellationToken, JobInstance) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Describes the argument a job expects, derived from a deserializable type.
#[derive(Clone, Copy)]
pub struct ArgumentShape {
    type_name: &'static str,
    validate: fn(&serde_json::Value) -> Result<(), serde_json::Error>,
}

impl ArgumentShape {
    /// Shape of `T`: a submitted argument is valid if it deserializes into `T`.
    pub fn of<T: DeserializeOwned>() -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            validate: validate_as::<T>,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn validate(&self, argument: &serde_json::Value) -> Result<(), serde_json::Error> {
        (self.validate)(argument)
    }
}

impl std::fmt::Debug for ArgumentShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArgumentShape")
            .field("type_name", &self.type_name)
            .finish()
    }
}

fn validate_as<T: DeserializeOwned>(value: &serde_json::Value) -> Result<(), serde_json::Error> {
    T::deserialize(value).map(drop)
}

/// Registration options for a job.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobOptions {
    argument_shape: Option<ArgumentShape>,
    scheduling_enabled: bool,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require submitted arguments to deserialize into `T`.
    pub fn argument<T: DeserializeOwned>(mut self) -> Self {
        self.argument_shape = Some(ArgumentShape::of::<T>());
        self
    }

    /// Allow callers to defer execution with a schedule time.
    pub fn scheduling(mut self, enabled: bool) -> Self {
        self.scheduling_enabled = enabled;
        self
    }
}

/// A registered job type. Immutable once registered.
pub struct JobDefinition {
    name: String,
    handler: Arc<dyn JobHandler>,
    argument_shape: Option<ArgumentShape>,
    scheduling_enabled: bool,
}

impl JobDefinition {
    pub(crate) fn new(name: String, handler: Arc<dyn JobHandler>, options: JobOptions) -> Self {
        Self {
            name,
            handler,
            argument_shape: options.argument_shape,
            scheduling_enabled: options.scheduling_enabled,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> Arc<dyn JobHandler> {
        Arc::clone(&self.handler)
    }

    pub fn argument_shape(&self) -> Option<ArgumentShape> {
        self.argument_shape
    }

    pub fn scheduling_enabled(&self) -> bool {
        self.scheduling_enabled
    }

    /// Check a submitted argument against the registered shape. Jobs
    /// without a shape accept any argument.
    pub fn validate_argument(&self, argument: &serde_json::Value) -> Result<(), JobError> {
        match &self.argument_shape {
            Some(shape) => shape
                .validate(argument)
                .map_err(|e| JobError::InvalidArgument {
                    name: self.name.clone(),
                    reason: e.to_string(),
                }),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("argument_shape", &self.argument_shape)
            .field("scheduling_enabled", &self.scheduling_enabled)
            .finish_non_exhaustive()
    }
}
