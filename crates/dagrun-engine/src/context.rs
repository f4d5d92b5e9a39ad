//! Shared engine dependencies

use std::path::PathBuf;
use std::sync::Arc;

use dagrun_core::Config;
use dagrun_dispatch::DispatchClient;
use dagrun_storage::RunStore;

/// Dependencies threaded through the execution subsystem
///
/// Cheap to clone; everything inside is shared.
#[derive(Clone)]
pub struct EngineContext {
    /// Run history store
    pub store: Arc<dyn RunStore>,

    /// Global configuration
    pub config: Arc<Config>,

    /// Directory of the current definition, for resolving sub-DAG paths
    pub dag_dir: PathBuf,

    /// Present when a coordinator is configured; enables remote dispatch
    pub dispatch_client: Option<Arc<DispatchClient>>,
}

impl EngineContext {
    /// Context with a store and configuration, no remote dispatch.
    pub fn new(store: Arc<dyn RunStore>, config: Arc<Config>) -> Self {
        Self {
            store,
            config,
            dag_dir: PathBuf::from("."),
            dispatch_client: None,
        }
    }

    /// Set the definition directory.
    pub fn with_dag_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dag_dir = dir.into();
        self
    }

    /// Enable remote dispatch through the coordinator.
    pub fn with_dispatch_client(mut self, client: Arc<DispatchClient>) -> Self {
        self.dispatch_client = Some(client);
        self
    }
}
