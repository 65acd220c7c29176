//! Reference host: fires lifecycle events at controllers and routes page
//! requests through the active one.
//!
//! ```text
//! ServiceWorkerHost
//!     ├── active (controller for one version tag)
//!     ├── workers (every version deployed, with its state)
//!     └── clients (open pages, each controlled by a version or by none)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::cache::CacheStorage;
use crate::config::Config;
use crate::controller::{ActivateOutcome, CachePolicyController, InstallOutcome};
use crate::error::ControllerError;
use crate::models::{Request, ServedResponse};
use crate::network::Fetcher;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("Install of {version} failed: {source}")]
    Install {
        version: String,
        #[source]
        source: ControllerError,
    },

    #[error("Activation of {version} failed: {source}")]
    Activate {
        version: String,
        #[source]
        source: ControllerError,
    },

    #[error("Unknown client: {0}")]
    UnknownClient(ClientId),

    #[error(transparent)]
    Fetch(#[from] ControllerError),
}

/// Worker lifecycle as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
    Redundant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub version: String,
    pub state: WorkerState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReport {
    pub install: InstallOutcome,
    /// `None` while the worker is waiting.
    pub activate: Option<ActivateOutcome>,
    /// Clients now controlled by the new version.
    pub controlled: usize,
}

type SharedController<S, F> = Arc<CachePolicyController<S, F>>;

/// An installed worker held back until `activate_waiting`.
struct Waiting<S, F> {
    index: usize,
    controller: SharedController<S, F>,
    install: InstallOutcome,
}

struct Registration<S, F> {
    active: Option<SharedController<S, F>>,
    waiting: Option<Waiting<S, F>>,
    workers: Vec<WorkerInfo>,
    // Version controlling each open client
    clients: HashMap<ClientId, Option<String>>,
}

pub struct ServiceWorkerHost<S, F> {
    storage: Arc<S>,
    fetcher: Arc<F>,
    registration: RwLock<Registration<S, F>>,
    next_client: AtomicU64,
}

impl<S, F> ServiceWorkerHost<S, F>
where
    S: CacheStorage,
    F: Fetcher,
{
    pub fn new(storage: Arc<S>, fetcher: Arc<F>) -> Self {
        Self {
            storage,
            fetcher,
            registration: RwLock::new(Registration {
                active: None,
                waiting: None,
                workers: Vec::new(),
                clients: HashMap::new(),
            }),
            next_client: AtomicU64::new(1),
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub async fn active_version(&self) -> Option<String> {
        self.registration
            .read()
            .await
            .active
            .as_ref()
            .map(|c| c.cache_name().to_string())
    }

    pub async fn waiting_version(&self) -> Option<String> {
        self.registration
            .read()
            .await
            .waiting
            .as_ref()
            .map(|w| w.controller.cache_name().to_string())
    }

    pub async fn workers(&self) -> Vec<WorkerInfo> {
        self.registration.read().await.workers.clone()
    }

    async fn set_state(&self, index: usize, state: WorkerState) {
        if let Some(worker) = self.registration.write().await.workers.get_mut(index) {
            worker.state = state;
        }
    }

    /// Install a version. A failed install leaves the current version serving.
    /// If the worker asked to skip waiting, or nothing is active yet, it is
    /// activated at once; otherwise it waits for `activate_waiting`.
    pub async fn deploy(&self, config: Config) -> Result<DeployReport, HostError> {
        let version = config.cache_name.clone();
        let controller = Arc::new(CachePolicyController::new(
            config,
            self.storage.clone(),
            self.fetcher.clone(),
        ));

        let index = {
            let mut reg = self.registration.write().await;
            reg.workers.push(WorkerInfo {
                version: version.clone(),
                state: WorkerState::Parsed,
            });
            reg.workers.len() - 1
        };

        self.set_state(index, WorkerState::Installing).await;
        let install = match controller.install().await {
            Ok(outcome) => outcome,
            Err(source) => {
                warn!(version = %version, error = %source, "Worker is redundant after failed install");
                self.set_state(index, WorkerState::Redundant).await;
                return Err(HostError::Install { version, source });
            }
        };

        {
            let mut reg = self.registration.write().await;
            if let Some(worker) = reg.workers.get_mut(index) {
                worker.state = WorkerState::Installed;
            }
            if !install.skip_waiting && reg.active.is_some() {
                // A newer install replaces whatever was already waiting
                if let Some(old) = reg.waiting.take() {
                    if let Some(worker) = reg.workers.get_mut(old.index) {
                        worker.state = WorkerState::Redundant;
                    }
                }
                reg.waiting = Some(Waiting {
                    index,
                    controller,
                    install: install.clone(),
                });
                info!(version = %version, "Worker installed and waiting");
                return Ok(DeployReport {
                    install,
                    activate: None,
                    controlled: 0,
                });
            }
        }

        self.activate_worker(index, controller, install).await
    }

    /// Activate the waiting worker, if there is one.
    pub async fn activate_waiting(&self) -> Result<Option<DeployReport>, HostError> {
        let waiting = self.registration.write().await.waiting.take();
        match waiting {
            Some(w) => self
                .activate_worker(w.index, w.controller, w.install)
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    async fn activate_worker(
        &self,
        index: usize,
        controller: SharedController<S, F>,
        install: InstallOutcome,
    ) -> Result<DeployReport, HostError> {
        let version = controller.cache_name().to_string();
        self.set_state(index, WorkerState::Activating).await;
        let activate = match controller.activate().await {
            Ok(outcome) => outcome,
            Err(source) => {
                warn!(version = %version, error = %source, "Worker is redundant after failed activation");
                self.set_state(index, WorkerState::Redundant).await;
                return Err(HostError::Activate { version, source });
            }
        };

        let mut reg = self.registration.write().await;
        let previous = reg.active.replace(controller).map(|c| c.cache_name().to_string());
        // An older worker still waiting is superseded
        if let Some(old) = reg.waiting.take() {
            if let Some(worker) = reg.workers.get_mut(old.index) {
                worker.state = WorkerState::Redundant;
            }
        }
        for (i, worker) in reg.workers.iter_mut().enumerate() {
            if i == index {
                worker.state = WorkerState::Activated;
            } else if worker.state == WorkerState::Activated {
                worker.state = WorkerState::Redundant;
            }
        }

        // Clients of the old version move over; claiming takes the rest too
        let mut controlled = 0;
        for owner in reg.clients.values_mut() {
            if owner.is_some() || activate.claim_clients {
                *owner = Some(version.clone());
                controlled += 1;
            }
        }

        info!(
            version = %version,
            previous = ?previous,
            controlled,
            "Worker activated"
        );
        Ok(DeployReport {
            install,
            activate: Some(activate),
            controlled,
        })
    }

    /// Open a page. It is controlled by the active version, if any.
    pub async fn open_client(&self) -> ClientId {
        let id = ClientId(self.next_client.fetch_add(1, Ordering::Relaxed));
        let mut reg = self.registration.write().await;
        let owner = reg.active.as_ref().map(|c| c.cache_name().to_string());
        reg.clients.insert(id, owner);
        id
    }

    pub async fn close_client(&self, id: ClientId) -> bool {
        self.registration.write().await.clients.remove(&id).is_some()
    }

    /// Version controlling a client, `None` if uncontrolled.
    pub async fn controller_of(&self, id: ClientId) -> Result<Option<String>, HostError> {
        self.registration
            .read()
            .await
            .clients
            .get(&id)
            .cloned()
            .ok_or(HostError::UnknownClient(id))
    }

    /// Route a page request: controlled clients go through the active
    /// controller, uncontrolled ones straight to the network.
    pub async fn dispatch_fetch(
        &self,
        client: ClientId,
        request: &Request,
    ) -> Result<ServedResponse, HostError> {
        let controller = {
            let reg = self.registration.read().await;
            let owner = reg
                .clients
                .get(&client)
                .ok_or(HostError::UnknownClient(client))?;
            match (owner, &reg.active) {
                (Some(_), Some(active)) => Some(active.clone()),
                _ => None,
            }
        };

        match controller {
            Some(controller) => Ok(controller.handle_fetch(request).await?),
            None => {
                let response = self
                    .fetcher
                    .fetch(request)
                    .await
                    .map_err(ControllerError::from)?;
                Ok(ServedResponse::from_network(response))
            }
        }
    }
}
