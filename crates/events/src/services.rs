//! Shared collaborators handed to every component at construction.

use std::future::Future;
use std::sync::Arc;

use settle_core::{Error, Result, SettleConfig};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::hub::{EventHub, HubConfig};
use crate::runner::{TaskRunner, TokioTaskRunner};
use crate::timer::{TimerService, TokioTimerService};

/// Runtime handle, task runner, timer service and configuration.
///
/// Cloning is cheap; clones share the same collaborators.
#[derive(Clone)]
pub struct Services {
    handle: Handle,
    runner: Arc<dyn TaskRunner>,
    timers: Arc<dyn TimerService>,
    config: Arc<SettleConfig>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Tokio-backed collaborators on the current runtime with default config.
    ///
    /// # Errors
    ///
    /// Returns `NoRuntime` when called outside a tokio runtime.
    pub fn current() -> Result<Self> {
        Self::with_config(SettleConfig::default())
    }

    /// Tokio-backed collaborators on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns `NoRuntime` outside a tokio runtime and `ConfigInvalid` when the
    /// config fails validation.
    pub fn with_config(config: SettleConfig) -> Result<Self> {
        config.validate()?;
        let handle = Handle::try_current().map_err(|e| Error::no_runtime(e.to_string()))?;
        Ok(Self {
            runner: Arc::new(TokioTaskRunner::new(handle.clone())),
            timers: Arc::new(TokioTimerService::new(handle.clone())),
            handle,
            config: Arc::new(config),
        })
    }

    /// Assemble from explicit collaborators.
    #[must_use]
    pub fn from_parts(
        handle: Handle,
        runner: Arc<dyn TaskRunner>,
        timers: Arc<dyn TimerService>,
        config: SettleConfig,
    ) -> Self {
        Self {
            handle,
            runner,
            timers,
            config: Arc::new(config),
        }
    }

    #[must_use]
    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    #[must_use]
    pub fn runner(&self) -> Arc<dyn TaskRunner> {
        self.runner.clone()
    }

    #[must_use]
    pub fn timers(&self) -> Arc<dyn TimerService> {
        self.timers.clone()
    }

    #[must_use]
    pub fn config(&self) -> &SettleConfig {
        &self.config
    }

    /// Spawn a future on the runtime.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// A new event hub delivering through this runner.
    pub fn event_hub<K, P>(&self, name: &str) -> EventHub<K, P>
    where
        K: Clone + Eq + std::hash::Hash + std::fmt::Debug + Send + Sync + 'static,
        P: Clone + Send + Sync + 'static,
    {
        EventHub::new(
            self.runner(),
            HubConfig::from_settings(name, &self.config.hub),
        )
    }
}
