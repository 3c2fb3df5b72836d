//! Runtime registry - named runtimes and the one serving requests

use crate::config::AppConfig;
use crate::runtime::{AgentRuntime, ProcessRuntime, TmuxRuntime};
use crate::{GasTownError, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

pub const DEFAULT_RUNTIME: &str = "tmux";

struct Inner {
    runtimes: HashMap<String, Arc<dyn AgentRuntime>>,
    active: String,
}

/// Name-keyed runtimes plus the active selection.
///
/// The active name starts as `tmux` whether or not one is registered;
/// [`RuntimeRegistry::active`] fails until it is.
pub struct RuntimeRegistry {
    inner: RwLock<Inner>,
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                runtimes: HashMap::new(),
                active: DEFAULT_RUNTIME.to_string(),
            }),
        }
    }

    /// Register under `name`, replacing any previous entry.
    pub fn register(&self, name: impl Into<String>, runtime: Arc<dyn AgentRuntime>) {
        let name = name.into();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.runtimes.insert(name.clone(), runtime).is_some() {
            warn!(runtime = %name, "Replaced registered runtime");
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn AgentRuntime>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .runtimes
            .get(name)
            .cloned()
            .ok_or_else(|| GasTownError::RuntimeNotFound(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = inner.runtimes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn set_active(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if !inner.runtimes.contains_key(name) {
            return Err(GasTownError::RuntimeNotFound(name.to_string()));
        }
        inner.active = name.to_string();
        info!(runtime = %name, "Active runtime set");
        Ok(())
    }

    pub fn active_name(&self) -> String {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).active.clone()
    }

    pub fn active(&self) -> Result<Arc<dyn AgentRuntime>> {
        let name = self.active_name();
        self.get(&name)
    }

    /// Close every runtime. All are attempted; the last failure is returned.
    pub async fn close_all(&self) -> Result<()> {
        let runtimes: Vec<(String, Arc<dyn AgentRuntime>)> = {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            inner
                .runtimes
                .iter()
                .map(|(name, rt)| (name.clone(), Arc::clone(rt)))
                .collect()
        };

        let mut last_err = None;
        for (name, runtime) in runtimes {
            if let Err(e) = runtime.close().await {
                warn!(runtime = %name, error = %e, "Failed to close runtime");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Both runtimes from config, with `config.runtime` active.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let registry = Self::new();
        registry.register("tmux", Arc::new(TmuxRuntime::new(config.tmux.clone())));
        registry.register("process", Arc::new(ProcessRuntime::new(config.process.clone())?));
        registry.set_active(&config.runtime)?;
        Ok(registry)
    }
}
