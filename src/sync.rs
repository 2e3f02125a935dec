//! Sync controller: owns the authoritative in-memory document and reconciles
//! it with the persisted store and the remote source.
//!
//! Every replacement of the document happens under the `state` lock, so at
//! most one read-modify-write sequence is in flight at a time. Remote fetches
//! run outside the lock; a late response is merged by the timestamp rule.

use crate::access::filter_state;
use crate::commands::{apply_command, Command};
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::merge::{adopt_remote, merge_newer, overlay_session, MergeOutcome};
use crate::models::{AppState, SessionView, SyncEvent, SyncPhase, SyncSettings, SyncStatus};
use crate::notifications::{compute_dynamic_notifications, show_report_reminder, unseen_count};
use crate::remote::{ConflictEvent, PushOutcome, RemoteSource};
use crate::sanitize::sanitize_app_state;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Offline,
    Unchanged,
    Updated { last_updated: i64 },
}

/// Background tasks started by [`SyncController::start`].
pub struct SyncTasks {
    poller: JoinHandle<()>,
    listener: JoinHandle<()>,
}

impl SyncTasks {
    pub fn shutdown(self) {
        self.poller.abort();
        self.listener.abort();
    }
}

#[derive(Clone)]
pub struct SyncController {
    store: Arc<Database>,
    remote: Arc<dyn RemoteSource>,
    settings: SyncSettings,
    state: Arc<Mutex<AppState>>,
    status: Arc<RwLock<SyncStatus>>,
    events: broadcast::Sender<SyncEvent>,
    view: Arc<watch::Sender<SessionView>>,
    store_changed: Arc<Notify>,
    data_updated_generation: Arc<AtomicU64>,
}

impl SyncController {
    /// Loads the local document. Nothing is fetched until [`Self::bootstrap`].
    pub fn new(
        store: Arc<Database>,
        remote: Arc<dyn RemoteSource>,
        settings: SyncSettings,
    ) -> AppResult<Self> {
        let local = store.load_state()?;
        let status = SyncStatus::default();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (view, _) = watch::channel(session_view(&local, &status));

        Ok(Self {
            store,
            remote,
            settings,
            state: Arc::new(Mutex::new(local)),
            status: Arc::new(RwLock::new(status)),
            events,
            view: Arc::new(view),
            store_changed: Arc::new(Notify::new()),
            data_updated_generation: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn status(&self) -> SyncStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn current_state(&self) -> AppState {
        self.state.lock().await.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn view(&self) -> watch::Receiver<SessionView> {
        self.view.subscribe()
    }

    /// First load: the remote copy, when reachable, replaces the local one
    /// whatever its clock, keeping the local session fields.
    pub async fn bootstrap(&self) -> AppResult<SyncPhase> {
        let fetched = self.remote.fetch().await;
        let mut state = self.state.lock().await;

        let Some(remote) = fetched else {
            tracing::warn!(
                local_version = state.last_updated,
                "remote unreachable at startup; continuing offline"
            );
            self.set_phase(SyncPhase::Offline);
            self.publish(&state);
            return Ok(SyncPhase::Offline);
        };

        let remote_version = remote.last_updated;
        let adopted = adopt_remote(&state, remote);
        self.store.write_snapshot(&adopted)?;
        *state = adopted;
        self.record_sync(remote_version, true);
        self.publish(&state);
        tracing::info!(remote_version, "adopted remote document at startup");
        Ok(SyncPhase::Online)
    }

    pub async fn poll_once(&self) -> AppResult<PollOutcome> {
        let Some(remote) = self.remote.fetch().await else {
            if self.set_phase(SyncPhase::Offline) {
                tracing::warn!("remote unreachable; serving the local document");
            }
            self.publish_status();
            return Ok(PollOutcome::Offline);
        };

        let remote_version = remote.last_updated;
        self.record_sync(remote_version, false);

        let mut state = self.state.lock().await;
        match merge_newer(&state, remote) {
            MergeOutcome::Replaced(merged) => {
                self.store.write_snapshot(&merged)?;
                tracing::info!(
                    local_version = state.last_updated,
                    remote_version,
                    "newer remote document received"
                );
                *state = merged;
                self.flag_data_updated(remote_version);
                self.publish(&state);
                Ok(PollOutcome::Updated {
                    last_updated: remote_version,
                })
            }
            MergeOutcome::KeptLocal => {
                tracing::debug!(
                    local_version = state.last_updated,
                    remote_version,
                    "remote document not newer; discarded"
                );
                self.publish_status();
                Ok(PollOutcome::Unchanged)
            }
        }
    }

    /// Consumes one rejected-write signal.
    pub async fn handle_conflict(&self, event: ConflictEvent) -> AppResult<()> {
        let mut state = self.state.lock().await;
        self.resolve_conflict(&mut state, event)
    }

    /// Applies `command` to the freshest document, persists the result and
    /// pushes it unless the command only touches session-local fields.
    /// Returns the full, unfiltered document.
    pub async fn dispatch(&self, command: Command) -> AppResult<AppState> {
        let name = command.name();
        let local_only = command.is_local_only();

        let mut state = self.state.lock().await;
        let next = apply_command(&state, command, Utc::now());
        if next == *state {
            tracing::debug!(command = name, "command left the document unchanged");
            return Ok(state.clone());
        }

        *state = self.store.save_state(&next)?;
        tracing::info!(command = name, last_updated = state.last_updated, "command applied");
        self.publish(&state);

        if !local_only {
            self.push_locked(&mut state).await?;
        }
        Ok(state.clone())
    }

    /// Signs `user_id` in on the freshest available document. The result is
    /// saved locally and not pushed.
    pub async fn login(&self, user_id: &str) -> AppResult<AppState> {
        let fetched = self.remote.fetch().await;
        let mut state = self.state.lock().await;

        let mut base = match fetched {
            Some(remote) => {
                self.record_sync(remote.last_updated, false);
                overlay_session(remote, &state)
            }
            None => {
                self.set_phase(SyncPhase::Offline);
                state.clone()
            }
        };

        let user = base
            .find_user(user_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("user {user_id} does not exist")))?;
        let role = user.role.as_str();
        base.current_user = Some(user);

        *state = self.store.save_state(&base)?;
        self.publish(&state);
        tracing::info!(user_id, role, last_updated = state.last_updated, "user signed in");
        Ok(state.clone())
    }

    pub async fn logout(&self) -> AppResult<AppState> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.current_user = None;

        *state = self.store.save_state(&next)?;
        self.publish(&state);
        tracing::info!("user signed out");
        Ok(state.clone())
    }

    /// Starts the polling loop and the store-change listener.
    pub fn start(&self) -> SyncTasks {
        let notify = self.store_changed.clone();
        let subscription = self.store.subscribe_to_store_updates(move |update| {
            tracing::debug!(last_updated = update.last_updated, "store changed by another handle");
            notify.notify_one();
        });

        let listener = {
            let controller = self.clone();
            tokio::spawn(async move {
                let _subscription = subscription;
                loop {
                    controller.store_changed.notified().await;
                    if let Err(error) = controller.reload_from_store().await {
                        tracing::error!(error = %error, "failed to reload document after store change");
                    }
                }
            })
        };

        let poller = {
            let controller = self.clone();
            let period = Duration::from_secs(self.settings.poll_interval_secs.max(1));
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if let Err(error) = controller.poll_once().await {
                        tracing::error!(error = %error, "poll failed to persist remote document");
                    }
                }
            })
        };

        SyncTasks { poller, listener }
    }

    async fn reload_from_store(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let stored = self.store.load_state()?;
        if let MergeOutcome::Replaced(merged) = merge_newer(&state, stored) {
            tracing::info!(last_updated = merged.last_updated, "adopted document written elsewhere");
            *state = merged;
            self.publish(&state);
            let _ = self.events.send(SyncEvent::ExternalChange);
        }
        Ok(())
    }

    async fn push_locked(&self, state: &mut AppState) -> AppResult<()> {
        let base_version = self.status().server_version;
        match self.remote.push(state, base_version).await {
            Ok(PushOutcome::Accepted { server_version }) => {
                self.record_sync(server_version, true);
                // The server restamps accepted writes; follow its clock so the
                // next poll does not report our own write as a remote update.
                if server_version > state.last_updated {
                    state.last_updated = server_version;
                    self.store.write_snapshot(state)?;
                    self.publish(state);
                } else {
                    self.publish_status();
                }
                tracing::debug!(server_version, "write accepted by remote");
                Ok(())
            }
            Ok(PushOutcome::Conflict(event)) => self.resolve_conflict(state, event),
            Err(error) => {
                tracing::warn!(error = %error, "push failed; local write kept");
                self.set_phase(SyncPhase::Offline);
                self.publish_status();
                Ok(())
            }
        }
    }

    fn resolve_conflict(&self, state: &mut AppState, event: ConflictEvent) -> AppResult<()> {
        let server = sanitize_app_state(event.server_data);
        let server_version = server.last_updated;
        self.record_sync(server_version, true);
        let _ = self.events.send(SyncEvent::Conflict { server_version });

        match merge_newer(state, server) {
            MergeOutcome::Replaced(merged) => {
                self.store.write_snapshot(&merged)?;
                tracing::warn!(
                    local_version = state.last_updated,
                    server_version,
                    "write rejected; adopted newer server document"
                );
                *state = merged;
                self.flag_data_updated(server_version);
                self.publish(state);
            }
            MergeOutcome::KeptLocal => {
                // The base version now matches the server, so the next push
                // overwrites its copy. Whole-document last-writer-wins.
                tracing::warn!(
                    local_version = state.last_updated,
                    server_version,
                    "write rejected; local document is newer and was kept"
                );
                self.publish_status();
            }
        }
        Ok(())
    }

    /// Marks the remote as reachable. `exact` replaces the known server
    /// version; otherwise it only moves forward, since poll responses may
    /// arrive out of order.
    fn record_sync(&self, server_version: i64, exact: bool) {
        let came_online = {
            let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
            status.last_sync_at = Some(Utc::now());
            status.server_version = match status.server_version {
                Some(known) if !exact => Some(known.max(server_version)),
                _ => Some(server_version),
            };
            let changed = status.phase != SyncPhase::Online;
            status.phase = SyncPhase::Online;
            changed
        };
        if came_online {
            tracing::info!(server_version, "remote reachable");
            let _ = self.events.send(SyncEvent::Online);
        }
    }

    /// Returns whether the phase changed.
    fn set_phase(&self, phase: SyncPhase) -> bool {
        let changed = {
            let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
            let changed = status.phase != phase;
            status.phase = phase;
            changed
        };
        if changed {
            let event = match phase {
                SyncPhase::Online => Some(SyncEvent::Online),
                SyncPhase::Offline => Some(SyncEvent::Offline),
                SyncPhase::Loading => None,
            };
            if let Some(event) = event {
                let _ = self.events.send(event);
            }
            tracing::info!(phase = phase.as_str(), "sync phase changed");
        }
        changed
    }

    /// Raises the transient "data updated" flag and clears it after the
    /// configured delay unless a newer update re-raised it meanwhile.
    fn flag_data_updated(&self, last_updated: i64) {
        let generation = self.data_updated_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.status
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .data_updated = true;
        let _ = self.events.send(SyncEvent::DataUpdated { last_updated });

        let controller = self.clone();
        let ttl = Duration::from_secs(self.settings.data_updated_ttl_secs);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if controller.data_updated_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            controller
                .status
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .data_updated = false;
            controller.publish_status();
            let _ = controller.events.send(SyncEvent::DataUpdatedCleared);
        });
    }

    fn publish(&self, state: &AppState) {
        self.view.send_replace(session_view(state, &self.status()));
    }

    fn publish_status(&self) {
        let status = self.status();
        self.view.send_modify(|view| view.status = status);
    }
}

fn session_view(state: &AppState, status: &SyncStatus) -> SessionView {
    let now = Utc::now();
    let dynamic_notifications = compute_dynamic_notifications(state, now);
    SessionView {
        state: filter_state(state),
        unseen_count: unseen_count(state, &dynamic_notifications),
        show_report_reminder: show_report_reminder(state, now),
        dynamic_notifications,
        status: status.clone(),
    }
}
