//! Session manager
//!
//! Starts and stops channel sessions. Every driver primitive runs on a
//! blocking thread. The sessions map lock is never held across a driver
//! call: a session sits in the map as `Initializing`/`Stopping` while its
//! driver call is in flight, which also rejects duplicate start/stop
//! requests for the same device.
//!
//! `start`, `stop` and `shutdown` run on their own tasks. A caller that
//! stops waiting (timeout, aborted task) does not leave a half-open
//! session behind; the operation still completes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use canmon_core::{BaudRate, BusDriver, ChannelHandle, DriverError, FrameEvent, LogicalDeviceId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{MonitorCounters, SessionInfo, SessionState, StateCell};
use crate::config::MonitorConfig;
use crate::discovery::DeviceList;
use crate::error::{SessionError, SessionResult};
use crate::monitor::{FrameMonitor, MonitorExit};
use crate::preferences::{BaudPreferences, PreferenceStore};
use crate::registry::ChannelRegistry;
use crate::responder::Responder;

/// What the user selected when asking for a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartRequest {
    pub device: Option<LogicalDeviceId>,
    pub baud: Option<BaudRate>,
}

impl StartRequest {
    pub fn new(device: impl Into<LogicalDeviceId>, baud: BaudRate) -> Self {
        Self {
            device: Some(device.into()),
            baud: Some(baud),
        }
    }
}

/// Outcome of comparing a device list against the running sessions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Devices with a session but missing from the list
    pub vanished: Vec<LogicalDeviceId>,
    /// Listed devices without a session
    pub available: Vec<LogicalDeviceId>,
}

struct Session {
    id: Uuid,
    handle: ChannelHandle,
    baud: BaudRate,
    cancel: Arc<AtomicBool>,
    state: StateCell,
    counters: Arc<MonitorCounters>,
    monitor: Option<JoinHandle<MonitorExit>>,
    started_at: DateTime<Utc>,
}

impl Session {
    fn info(&self, device: &LogicalDeviceId) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            device: device.clone(),
            handle: self.handle,
            baud: self.baud,
            state: self.state.get(),
            started_at: self.started_at,
            counters: self.counters.snapshot(),
        }
    }
}

/// Owns all channel sessions
pub struct SessionManager {
    shared: Arc<Shared>,
}

struct Shared {
    driver: Arc<dyn BusDriver>,
    registry: ChannelRegistry,
    sessions: Mutex<HashMap<LogicalDeviceId, Session>>,
    /// Last handle each device ran on; reused on the next start when free
    preferred: SyncMutex<HashMap<LogicalDeviceId, ChannelHandle>>,
    /// Physical channel of each device in the latest device list. A listed
    /// device only ever opens this handle.
    discovered: SyncMutex<HashMap<LogicalDeviceId, ChannelHandle>>,
    events: broadcast::Sender<FrameEvent>,
    preferences: SyncMutex<BaudPreferences>,
    preference_store: RwLock<Option<Arc<dyn PreferenceStore>>>,
    config: MonitorConfig,
    shutting_down: AtomicBool,
    /// Bumped whenever an in-flight start or stop finishes
    settled: watch::Sender<()>,
}

impl SessionManager {
    pub fn new(driver: Arc<dyn BusDriver>, config: MonitorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (settled, _) = watch::channel(());
        Self {
            shared: Arc::new(Shared {
                driver,
                registry: ChannelRegistry::new(),
                sessions: Mutex::new(HashMap::new()),
                preferred: SyncMutex::new(HashMap::new()),
                discovered: SyncMutex::new(HashMap::new()),
                events,
                preferences: SyncMutex::new(BaudPreferences::default()),
                preference_store: RwLock::new(None),
                config,
                shutting_down: AtomicBool::new(false),
                settled,
            }),
        }
    }

    /// Load remembered baud rates from `store` and save back on every start
    pub fn with_preference_store(self, store: Arc<dyn PreferenceStore>) -> Self {
        match store.load() {
            Ok(loaded) => {
                debug!(entries = loaded.len(), "Loaded baud preferences");
                *self.shared.preferences.lock() = loaded;
            }
            Err(e) => warn!(error = %e, "Ignoring unreadable baud preferences"),
        }
        *self.shared.preference_store.write() = Some(store);
        self
    }

    pub fn driver(&self) -> &Arc<dyn BusDriver> {
        &self.shared.driver
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.shared.registry
    }

    /// Receive every frame observed by any session
    pub fn subscribe(&self) -> broadcast::Receiver<FrameEvent> {
        self.shared.events.subscribe()
    }

    /// Baud rate saved for `device` by an earlier start
    pub fn remembered_baud(&self, device: &LogicalDeviceId) -> Option<BaudRate> {
        self.shared.preferences.lock().get(device)
    }

    /// Pre-selected baud rate for `device` (remembered, else 500 kbit/s)
    pub fn baud_selection(&self, device: &LogicalDeviceId) -> BaudRate {
        self.shared.preferences.lock().selection_for(device)
    }

    pub fn preferences(&self) -> BaudPreferences {
        self.shared.preferences.lock().clone()
    }

    /// Handle `device` will ask for on its next start
    pub fn preferred_handle(&self, device: &LogicalDeviceId) -> Option<ChannelHandle> {
        self.shared.requested_handle(device)
    }

    /// Start a session
    pub async fn start(&self, request: StartRequest) -> SessionResult<SessionInfo> {
        let shared = self.shared.clone();
        tokio::spawn(async move { shared.start(request).await }).await?
    }

    /// Start with the remembered (or default) baud rate
    pub async fn start_remembered(&self, device: LogicalDeviceId) -> SessionResult<SessionInfo> {
        let baud = self.baud_selection(&device);
        self.start(StartRequest::new(device, baud)).await
    }

    /// Stop a session. The handle returns to the pool even when the driver
    /// fails to uninitialize; that failure is still reported.
    pub async fn stop(&self, device: &LogicalDeviceId) -> SessionResult<()> {
        let shared = self.shared.clone();
        let device = device.clone();
        tokio::spawn(async move { shared.stop(&device).await }).await?
    }

    /// Stop every session (process teardown) and refuse new ones. Waits for
    /// starts and stops still in flight. Returns the failures; all handles
    /// are back in the pool afterwards.
    pub async fn shutdown(&self) -> Vec<(LogicalDeviceId, SessionError)> {
        let shared = self.shared.clone();
        match tokio::spawn(async move { shared.shutdown().await }).await {
            Ok(failures) => failures,
            Err(e) => {
                error!(error = %e, "Shutdown task failed");
                Vec::new()
            }
        }
    }

    /// Lifecycle state of `device`'s session (`Idle` when there is none)
    pub async fn state(&self, device: &LogicalDeviceId) -> SessionState {
        self.shared
            .sessions
            .lock()
            .await
            .get(device)
            .map(|s| s.state.get())
            .unwrap_or_default()
    }

    pub async fn session(&self, device: &LogicalDeviceId) -> Option<SessionInfo> {
        self.shared
            .sessions
            .lock()
            .await
            .get(device)
            .map(|s| s.info(device))
    }

    /// All sessions, ordered by handle
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.shared.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|(device, session)| session.info(device))
            .collect();
        infos.sort_by_key(|info| info.handle);
        infos
    }

    /// Compare a refreshed device list with the running sessions
    ///
    /// Every listed channel becomes the fixed handle of its device, so
    /// starting a discovered device opens the channel it was found on (or
    /// fails with [`SessionError::ChannelOccupied`]).
    pub async fn reconcile(&self, list: &DeviceList) -> Reconciliation {
        let sessions = self.shared.sessions.lock().await;

        *self.shared.discovered.lock() = list
            .channels
            .iter()
            .filter_map(|c| c.handle.map(|handle| (c.device.clone(), handle)))
            .collect();

        let mut vanished: Vec<LogicalDeviceId> = sessions
            .iter()
            .filter(|(device, s)| s.state.get().is_stoppable() && !list.contains(device))
            .map(|(device, _)| device.clone())
            .collect();
        vanished.sort();

        let available = list
            .channels
            .iter()
            .filter(|c| !sessions.contains_key(&c.device))
            .map(|c| c.device.clone())
            .collect();

        Reconciliation {
            vanished,
            available,
        }
    }
}

impl Shared {
    fn requested_handle(&self, device: &LogicalDeviceId) -> Option<ChannelHandle> {
        let discovered = self.discovered.lock().get(device).copied();
        discovered.or_else(|| self.preferred.lock().get(device).copied())
    }

    /// Pick the handle for `device`: its discovered channel (exactly), else
    /// its previous handle or the lowest free one
    fn allocate_for(&self, device: &LogicalDeviceId) -> SessionResult<ChannelHandle> {
        let discovered = self.discovered.lock().get(device).copied();
        match discovered {
            Some(handle) if self.registry.claim(handle) => Ok(handle),
            Some(handle) => Err(SessionError::ChannelOccupied {
                device: device.clone(),
                handle,
            }),
            None => {
                let preferred = self.preferred.lock().get(device).copied();
                Ok(self.registry.allocate_preferred(preferred)?)
            }
        }
    }

    fn settle(&self) {
        self.settled.send_replace(());
    }

    async fn start(&self, request: StartRequest) -> SessionResult<SessionInfo> {
        let device = request
            .device
            .filter(|d| !d.is_blank())
            .ok_or(SessionError::NoDeviceSelected)?;
        let baud = request.baud.ok_or(SessionError::NoBaudrateSelected)?;

        let (handle, state) = {
            let mut sessions = self.sessions.lock().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(SessionError::ShuttingDown);
            }
            if sessions.contains_key(&device) {
                return Err(SessionError::AlreadyActive(device));
            }

            let handle = self.allocate_for(&device)?;
            let state = StateCell::new(device.clone(), handle);
            state.transition(SessionState::Initializing);

            sessions.insert(
                device.clone(),
                Session {
                    id: Uuid::new_v4(),
                    handle,
                    baud,
                    cancel: Arc::new(AtomicBool::new(false)),
                    state: state.clone(),
                    counters: Arc::new(MonitorCounters::default()),
                    monitor: None,
                    started_at: Utc::now(),
                },
            );
            (handle, state)
        };

        info!(%device, %handle, %baud, "Initializing channel");
        let driver = self.driver.clone();
        let init = tokio::task::spawn_blocking(move || driver.initialize(handle, baud))
            .await
            .map_err(SessionError::from)
            .and_then(|r| {
                r.map_err(|source| SessionError::DriverInitFailed { handle, source })
            });

        if let Err(e) = init {
            self.discard(&device, handle, &state).await;
            error!(%device, %handle, error = %e, "Channel initialization failed");
            return Err(e);
        }

        // Shutdown began while the driver was opening the channel
        if self.shutting_down.load(Ordering::SeqCst) {
            warn!(%device, %handle, "Shutting down, closing freshly opened channel");
            let driver = self.driver.clone();
            match tokio::task::spawn_blocking(move || driver.uninitialize(handle)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(%device, %handle, error = %e, "Failed to close channel"),
                Err(e) => error!(%device, %handle, error = %e, "Uninitialize task failed"),
            }
            self.discard(&device, handle, &state).await;
            return Err(SessionError::ShuttingDown);
        }

        let info = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(&device) else {
                // Entry cannot vanish while Initializing
                self.registry.release(handle);
                return Err(SessionError::NotActive(device));
            };

            let monitor = FrameMonitor {
                device: device.clone(),
                handle,
                driver: self.driver.clone(),
                cancel: session.cancel.clone(),
                events: self.events.clone(),
                responder: Responder::new(),
                counters: session.counters.clone(),
                state: state.clone(),
                config: self.config.clone(),
            };
            state.transition(SessionState::Active);
            session.monitor = Some(monitor.spawn());
            session.info(&device)
        };
        self.settle();

        self.preferred.lock().insert(device.clone(), handle);
        self.remember_baud(&device, baud).await;

        info!(%device, %handle, %baud, session_id = %info.session_id, "Session started");
        Ok(info)
    }

    /// Drop a session that never became active and free its handle
    async fn discard(&self, device: &LogicalDeviceId, handle: ChannelHandle, state: &StateCell) {
        self.sessions.lock().await.remove(device);
        self.registry.release(handle);
        state.transition(SessionState::Idle);
        self.settle();
    }

    async fn stop(&self, device: &LogicalDeviceId) -> SessionResult<()> {
        let (handle, state, monitor) = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(device)
                .filter(|s| s.state.get().is_stoppable())
                .ok_or_else(|| SessionError::NotActive(device.clone()))?;

            session.state.transition(SessionState::Stopping);
            session.cancel.store(true, Ordering::SeqCst);
            (session.handle, session.state.clone(), session.monitor.take())
        };

        info!(%device, %handle, "Stopping session");

        // Uninitialize without waiting for the monitor to notice the flag;
        // an in-flight read fails and the monitor exits cancelled
        let driver = self.driver.clone();
        let uninit = tokio::task::spawn_blocking(move || driver.uninitialize(handle))
            .await
            .map_err(SessionError::from)
            .and_then(|r| {
                r.or_else(|e| match e {
                    DriverError::NotInitialized(_) => {
                        debug!(%handle, "Channel was already uninitialized");
                        Ok(())
                    }
                    source => Err(SessionError::DriverUninitFailed { handle, source }),
                })
            });

        if let Some(monitor) = monitor {
            match monitor.await {
                Ok(exit) => debug!(%device, %handle, ?exit, "Frame monitor joined"),
                Err(e) => error!(%device, %handle, error = %e, "Frame monitor task failed"),
            }
        }

        self.sessions.lock().await.remove(device);
        self.registry.release(handle);
        state.transition(SessionState::Idle);
        self.settle();

        match &uninit {
            Ok(()) => info!(%device, %handle, "Session stopped"),
            Err(e) => warn!(%device, %handle, error = %e, "Session stopped with driver error"),
        }
        uninit
    }

    async fn shutdown(&self) -> Vec<(LogicalDeviceId, SessionError)> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut settled = self.settled.subscribe();
        let mut failures = Vec::new();

        loop {
            let (stoppable, in_flight) = {
                let sessions = self.sessions.lock().await;
                let stoppable: Vec<LogicalDeviceId> = sessions
                    .iter()
                    .filter(|(_, s)| s.state.get().is_stoppable())
                    .map(|(device, _)| device.clone())
                    .collect();
                (stoppable, sessions.len())
            };
            if in_flight == 0 {
                break;
            }

            if stoppable.is_empty() {
                debug!(sessions = in_flight, "Waiting for sessions in transition");
                if settled.changed().await.is_err() {
                    break;
                }
                continue;
            }

            info!(count = stoppable.len(), "Stopping all sessions");
            for device in stoppable {
                match self.stop(&device).await {
                    Ok(()) | Err(SessionError::NotActive(_)) => {}
                    Err(e) => failures.push((device, e)),
                }
            }
        }
        failures
    }

    /// Remember the baud rate and hand the map to the store (every start)
    async fn remember_baud(&self, device: &LogicalDeviceId, baud: BaudRate) {
        let snapshot = {
            let mut preferences = self.preferences.lock();
            preferences.remember(device, baud);
            preferences.clone()
        };

        let Some(store) = self.preference_store.read().clone() else {
            return;
        };
        match tokio::task::spawn_blocking(move || store.save(&snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%device, error = %e, "Failed to save baud preferences"),
            Err(e) => warn!(%device, error = %e, "Preference save task failed"),
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        // Best effort for managers dropped without shutdown(): monitors exit,
        // channels stay initialized
        if let Ok(sessions) = self.shared.sessions.try_lock() {
            for session in sessions.values() {
                session.cancel.store(true, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::driver::mock::{DriverCall, MockBusDriver};
    use crate::preferences::MemoryPreferenceStore;

    fn manager() -> (Arc<MockBusDriver>, SessionManager) {
        let driver = Arc::new(MockBusDriver::new());
        let manager = SessionManager::new(driver.clone(), MonitorConfig::default());
        (driver, manager)
    }

    fn h(n: u8) -> ChannelHandle {
        ChannelHandle::new(n).unwrap()
    }

    #[tokio::test]
    async fn test_start_validates_selection() {
        let (driver, manager) = manager();

        let err = manager.start(StartRequest::default()).await.unwrap_err();
        assert!(matches!(err, SessionError::NoDeviceSelected));

        let blank = StartRequest {
            device: Some(LogicalDeviceId::new(" ")),
            baud: Some(BaudRate::Baud500K),
        };
        assert!(matches!(
            manager.start(blank).await,
            Err(SessionError::NoDeviceSelected)
        ));

        let no_baud = StartRequest {
            device: Some(LogicalDeviceId::new("D1")),
            baud: None,
        };
        assert!(matches!(
            manager.start(no_baud).await,
            Err(SessionError::NoBaudrateSelected)
        ));

        assert!(driver.calls().is_empty());
        assert!(manager.registry().assigned().is_empty());
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let (driver, manager) = manager();
        let d1 = LogicalDeviceId::new("D1");

        let info = manager
            .start(StartRequest::new("D1", BaudRate::Baud500K))
            .await
            .unwrap();
        assert_eq!(info.handle, h(1));
        assert_eq!(info.state, SessionState::Active);
        assert_eq!(manager.state(&d1).await, SessionState::Active);
        assert_eq!(driver.baud(h(1)), Some(BaudRate::Baud500K));

        assert!(matches!(
            manager.start(StartRequest::new("D1", BaudRate::Baud250K)).await,
            Err(SessionError::AlreadyActive(_))
        ));

        manager.stop(&d1).await.unwrap();
        assert_eq!(manager.state(&d1).await, SessionState::Idle);
        assert!(!driver.is_initialized(h(1)));
        assert!(!manager.registry().is_assigned(h(1)));

        assert!(matches!(
            manager.stop(&d1).await,
            Err(SessionError::NotActive(_))
        ));
        assert_eq!(
            driver.calls(),
            vec![
                DriverCall::Initialize(h(1), BaudRate::Baud500K),
                DriverCall::Uninitialize(h(1)),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_initialize_leaves_no_session() {
        let (driver, manager) = manager();
        driver.set_initialize_failure(
            h(1),
            Some(DriverError::Unavailable(h(1), "busy".to_string())),
        );

        let err = manager
            .start(StartRequest::new("D1", BaudRate::Baud500K))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::DriverInitFailed { handle, .. } if handle == h(1)
        ));
        assert!(manager.registry().assigned().is_empty());
        assert!(manager.sessions().await.is_empty());
        assert_eq!(manager.remembered_baud(&LogicalDeviceId::new("D1")), None);
        assert_eq!(manager.preferred_handle(&LogicalDeviceId::new("D1")), None);
    }

    #[tokio::test]
    async fn test_restart_reuses_handle() {
        let (_driver, manager) = manager();
        let d2 = LogicalDeviceId::new("D2");

        manager
            .start(StartRequest::new("D1", BaudRate::Baud500K))
            .await
            .unwrap();
        let first = manager
            .start(StartRequest::new("D2", BaudRate::Baud500K))
            .await
            .unwrap();
        assert_eq!(first.handle, h(2));

        manager.stop(&LogicalDeviceId::new("D1")).await.unwrap();
        manager.stop(&d2).await.unwrap();

        // Lowest free is 1, but D2 goes back to 2
        let again = manager
            .start(StartRequest::new("D2", BaudRate::Baud125K))
            .await
            .unwrap();
        assert_eq!(again.handle, h(2));
        assert_ne!(again.session_id, first.session_id);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_uninitialize_failure_still_releases_handle() {
        let (driver, manager) = manager();
        let d1 = LogicalDeviceId::new("D1");
        manager
            .start(StartRequest::new("D1", BaudRate::Baud500K))
            .await
            .unwrap();

        driver.set_uninitialize_failure(h(1), Some(DriverError::Io("usb reset".to_string())));
        let err = manager.stop(&d1).await.unwrap_err();
        assert!(matches!(err, SessionError::DriverUninitFailed { .. }));
        assert!(!manager.registry().is_assigned(h(1)));
        assert_eq!(manager.state(&d1).await, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_baud_is_remembered() {
        let driver = Arc::new(MockBusDriver::new());
        let store = Arc::new(MemoryPreferenceStore::new());
        let manager = SessionManager::new(driver, MonitorConfig::default())
            .with_preference_store(store.clone());
        let d1 = LogicalDeviceId::new("D1");

        assert_eq!(manager.baud_selection(&d1), BaudRate::Baud500K);
        manager
            .start(StartRequest::new("D1", BaudRate::Baud125K))
            .await
            .unwrap();
        manager.stop(&d1).await.unwrap();

        assert_eq!(manager.remembered_baud(&d1), Some(BaudRate::Baud125K));
        assert_eq!(store.snapshot().get(&d1), Some(BaudRate::Baud125K));
        assert_eq!(store.save_count(), 1);

        // Same rate again still reaches the store
        let info = manager.start_remembered(d1.clone()).await.unwrap();
        assert_eq!(info.baud, BaudRate::Baud125K);
        assert_eq!(store.save_count(), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let (driver, manager) = manager();
        for name in ["D1", "D2", "D3"] {
            manager
                .start(StartRequest::new(name, BaudRate::Baud500K))
                .await
                .unwrap();
        }

        let failures = manager.shutdown().await;
        assert!(failures.is_empty());
        assert!(manager.sessions().await.is_empty());
        assert!(manager.registry().assigned().is_empty());
        for n in 1..=3 {
            assert!(!driver.is_initialized(h(n)));
        }
    }

    fn slow_manager() -> (Arc<MockBusDriver>, Arc<SessionManager>) {
        let driver = Arc::new(MockBusDriver::new().with_latency(Duration::from_millis(200)));
        let manager = Arc::new(SessionManager::new(driver.clone(), MonitorConfig::default()));
        (driver, manager)
    }

    #[tokio::test]
    async fn test_abandoned_start_still_completes() {
        let (driver, manager) = slow_manager();
        let d1 = LogicalDeviceId::new("D1");

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            manager.start(StartRequest::new("D1", BaudRate::Baud500K)),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.state(&d1).await != SessionState::Active {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        manager.stop(&d1).await.unwrap();
        assert!(!driver.is_initialized(h(1)));
        assert!(manager.registry().assigned().is_empty());

        let again = manager
            .start(StartRequest::new("D1", BaudRate::Baud500K))
            .await
            .unwrap();
        assert_eq!(again.handle, h(1));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_start_in_flight() {
        let (driver, manager) = slow_manager();

        let starting = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .start(StartRequest::new("D1", BaudRate::Baud500K))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            manager.state(&LogicalDeviceId::new("D1")).await,
            SessionState::Initializing
        );

        let failures = manager.shutdown().await;
        assert!(failures.is_empty());
        assert!(matches!(
            starting.await.unwrap(),
            Err(SessionError::ShuttingDown)
        ));
        assert!(manager.sessions().await.is_empty());
        assert!(manager.registry().assigned().is_empty());
        assert!(!driver.is_initialized(h(1)));

        assert!(matches!(
            manager.start(StartRequest::new("D2", BaudRate::Baud500K)).await,
            Err(SessionError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_stop_in_flight() {
        let (driver, manager) = slow_manager();
        let d1 = LogicalDeviceId::new("D1");
        manager
            .start(StartRequest::new("D1", BaudRate::Baud500K))
            .await
            .unwrap();

        // Caller gives up on the stop; it still runs to the end
        let abandoned = tokio::time::timeout(Duration::from_millis(20), manager.stop(&d1)).await;
        assert!(abandoned.is_err());
        assert_eq!(manager.state(&d1).await, SessionState::Stopping);

        assert!(manager.shutdown().await.is_empty());
        assert!(manager.sessions().await.is_empty());
        assert!(manager.registry().assigned().is_empty());
        assert!(!driver.is_initialized(h(1)));
    }

    #[tokio::test]
    async fn test_discovered_device_keeps_its_channel() {
        let driver = Arc::new(MockBusDriver::with_present([h(1), h(2)]));
        let manager = SessionManager::new(driver.clone(), MonitorConfig::default());
        manager
            .reconcile(&crate::discovery::probe_channels(driver.as_ref()))
            .await;
        let usbbus1 = LogicalDeviceId::new("USBBUS1");
        assert_eq!(manager.preferred_handle(&usbbus1), Some(h(1)));

        // Undiscovered device takes the lowest free handle
        let other = manager
            .start(StartRequest::new("mydev", BaudRate::Baud500K))
            .await
            .unwrap();
        assert_eq!(other.handle, h(1));

        let err = manager
            .start(StartRequest::new("USBBUS1", BaudRate::Baud500K))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::ChannelOccupied { ref device, handle } if *device == usbbus1 && handle == h(1)
        ));
        assert_eq!(manager.registry().assigned(), vec![h(1)]);

        let usbbus2 = manager
            .start(StartRequest::new("USBBUS2", BaudRate::Baud500K))
            .await
            .unwrap();
        assert_eq!(usbbus2.handle, h(2));

        manager.stop(&LogicalDeviceId::new("mydev")).await.unwrap();
        let usbbus1_session = manager
            .start(StartRequest::new("USBBUS1", BaudRate::Baud500K))
            .await
            .unwrap();
        assert_eq!(usbbus1_session.handle, h(1));
        manager.shutdown().await;
    }
}
