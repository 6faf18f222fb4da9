//! Session-wide composition: one authenticated session, many spaces.
//!
//! The context owns the API handle, the auth session, and one sync
//! engine per open space. It also fronts the provider's user storage
//! with a small read cache and reacts to global stream events (space
//! lifecycle, storage invalidation).

use crate::api::SpaceApi;
use crate::auth::AuthSession;
use crate::checkpoint::CheckpointController;
use crate::config::ClientIdentity;
use crate::engine::SpaceSyncEngine;
use crate::error::ClientResult;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use tether_core::SpaceId;
use tether_proto::StreamEvent;

/// One user session across all their spaces.
pub struct SessionContext<A: SpaceApi> {
    api: Arc<A>,
    auth: Arc<AuthSession>,
    identity: ClientIdentity,
    engines: RwLock<BTreeMap<SpaceId, Arc<SpaceSyncEngine<A>>>>,
    storage_cache: Mutex<BTreeMap<String, Value>>,
    global_listeners: Mutex<Vec<mpsc::Sender<StreamEvent>>>,
}

impl<A: SpaceApi> SessionContext<A> {
    /// Creates a context. Spaces are opened on demand.
    pub fn new(api: Arc<A>, auth: Arc<AuthSession>, identity: ClientIdentity) -> Arc<Self> {
        Arc::new(Self {
            api,
            auth,
            identity,
            engines: RwLock::new(BTreeMap::new()),
            storage_cache: Mutex::new(BTreeMap::new()),
            global_listeners: Mutex::new(Vec::new()),
        })
    }

    /// The auth session.
    #[must_use]
    pub fn auth(&self) -> &Arc<AuthSession> {
        &self.auth
    }

    /// The API handle.
    #[must_use]
    pub fn api(&self) -> &Arc<A> {
        &self.api
    }

    /// Who this session acts as.
    #[must_use]
    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Returns the engine for a space, fetching and opening it on first
    /// use. At most one engine exists per space.
    pub fn open_space(&self, id: &SpaceId) -> ClientResult<Arc<SpaceSyncEngine<A>>> {
        if let Some(engine) = self.engines.read().get(id) {
            return Ok(engine.clone());
        }
        // Opened outside the lock; a concurrent open of the same space
        // is resolved below in favor of whoever inserted first.
        let engine = SpaceSyncEngine::open(
            self.api.clone(),
            self.auth.clone(),
            self.identity.clone(),
            id.clone(),
        )?;
        let mut engines = self.engines.write();
        match engines.entry(id.clone()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(engine.clone());
                Ok(engine)
            }
        }
    }

    /// The engine for a space, if it is open.
    #[must_use]
    pub fn engine(&self, id: &SpaceId) -> Option<Arc<SpaceSyncEngine<A>>> {
        self.engines.read().get(id).cloned()
    }

    /// Forgets a space's engine. Returns false if it was not open.
    pub fn close_space(&self, id: &SpaceId) -> bool {
        let removed = self.engines.write().remove(id).is_some();
        if removed {
            tracing::info!(space = %id, "space closed");
        }
        removed
    }

    /// Ids of the spaces currently open.
    #[must_use]
    pub fn open_spaces(&self) -> Vec<SpaceId> {
        self.engines.read().keys().cloned().collect()
    }

    /// A checkpoint controller for a space. The space does not need to
    /// be open.
    #[must_use]
    pub fn checkpoints(&self, id: &SpaceId) -> CheckpointController<A> {
        CheckpointController::new(self.api.clone(), self.auth.clone(), id.clone())
    }

    /// Reads one user-storage value, serving repeated reads from cache
    /// until the server signals a change.
    pub fn storage_get(&self, key: &str) -> ClientResult<Option<Value>> {
        if let Some(value) = self.storage_cache.lock().get(key) {
            return Ok(Some(value.clone()));
        }
        let token = self.auth.token()?;
        let value = self.auth.provider().get_storage(&token, key)?;
        if let Some(value) = &value {
            self.storage_cache.lock().insert(key.to_string(), value.clone());
        }
        Ok(value)
    }

    /// Writes one user-storage value through to the provider.
    pub fn storage_set(&self, key: &str, value: Value) -> ClientResult<()> {
        let token = self.auth.token()?;
        self.auth.provider().set_storage(&token, key, &value)?;
        self.storage_cache.lock().insert(key.to_string(), value);
        Ok(())
    }

    /// Reacts to one global stream event, then re-broadcasts it to
    /// [`on_global_event`] listeners.
    ///
    /// [`on_global_event`]: SessionContext::on_global_event
    pub fn handle_global_event(&self, event: &StreamEvent) {
        match event {
            StreamEvent::SpaceDeleted { space_id, .. } => {
                let id = SpaceId::new(space_id.clone());
                if self.close_space(&id) {
                    tracing::info!(space = %id, "space deleted remotely");
                }
            }
            StreamEvent::UserStorageChanged { .. } => {
                tracing::debug!("user storage changed, dropping cache");
                self.storage_cache.lock().clear();
            }
            StreamEvent::Unknown { event_type } => {
                tracing::warn!(event_type, "ignoring unknown global event");
            }
            _ => {}
        }
        self.global_listeners
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Subscribes to the re-broadcast global event feed.
    pub fn on_global_event(&self) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel();
        self.global_listeners.lock().push(tx);
        rx
    }

    /// Drives the context from a global stream receiver on a dedicated
    /// thread. The thread ends when the sender side hangs up.
    pub fn spawn_global_pump(
        context: Arc<Self>,
        events: mpsc::Receiver<StreamEvent>,
    ) -> JoinHandle<()>
    where
        A: 'static,
    {
        std::thread::spawn(move || {
            while let Ok(event) = events.recv() {
                context.handle_global_event(&event);
            }
            tracing::debug!("global event pump stopped");
        })
    }

    /// Ends the session: drops every engine, the storage cache, and the
    /// credentials.
    pub fn logout(&self) {
        let closed = {
            let mut engines = self.engines.write();
            let count = engines.len();
            engines.clear();
            count
        };
        self.storage_cache.lock().clear();
        self.auth.logout();
        tracing::info!(spaces = closed, "session ended");
    }
}
