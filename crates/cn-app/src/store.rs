//! Session-scoped lifecycle store.
//!
//! [`LifecycleStore`] owns the draft, the job history and the active job
//! id. It is the single source of truth for rendering: every committed
//! mutation is delivered synchronously to registered observers before the
//! mutating call returns, then published on a [`tokio::sync::watch`]
//! channel for async renderers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, warn};
use crate::draft::{DraftPatch, DraftRequest};
use crate::error::{StaleUpdateError, StoreError, TransitionError};
use crate::events::StoreEvent;
use crate::job::{JobId, JobPatch, JobRecord};

/// Consistent view of the store at one revision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub revision: u64,
    pub draft: DraftRequest,
    /// Records fetched from the service come first, ordered by creation
    /// time; records appended this session follow in append order.
    pub history: Vec<JobRecord>,
    pub active_id: Option<JobId>,
    /// Length of the appended tail of `history`.
    pub(crate) appended: usize,
}

impl StoreSnapshot {
    pub fn most_recent(&self) -> Option<&JobRecord> {
        self.history.last()
    }

    pub fn active(&self) -> Option<&JobRecord> {
        let id = self.active_id.as_ref()?;
        self.job(id)
    }

    pub fn job(&self, id: &JobId) -> Option<&JobRecord> {
        self.history.iter().find(|job| job.is_id(id))
    }

    fn position(&self, id: &JobId) -> Option<usize> {
        self.history.iter().position(|job| job.is_id(id))
    }

    fn fetched_len(&self) -> usize {
        self.history.len() - self.appended
    }
}

/// Receives every committed mutation.
///
/// Called synchronously while the store serializes dispatch, so an
/// observer must not mutate the store from inside `on_change`. Reading it
/// is fine.
pub trait StoreObserver: Send + Sync {
    fn on_change(&self, event: &StoreEvent, snapshot: &StoreSnapshot);
}

impl<F> StoreObserver for F
where
    F: Fn(&StoreEvent, &StoreSnapshot) + Send + Sync,
{
    fn on_change(&self, event: &StoreEvent, snapshot: &StoreSnapshot) {
        self(event, snapshot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied,
    Unchanged,
    /// No record with that id; tolerated for late-arriving updates.
    UnknownJob,
    Rejected(TransitionError),
}

pub struct LifecycleStore {
    state: Mutex<StoreSnapshot>,
    /// Held across mutate + notify so observers see revisions in order.
    dispatch: Mutex<()>,
    observers: Mutex<Vec<(ObserverId, Arc<dyn StoreObserver>)>>,
    next_observer: AtomicU64,
    snapshots: watch::Sender<StoreSnapshot>,
}

impl Default for LifecycleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleStore {
    pub fn new() -> Self {
        let (snapshots, _) = watch::channel(StoreSnapshot::default());

        Self {
            state: Mutex::new(StoreSnapshot::default()),
            dispatch: Mutex::new(()),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(0),
            snapshots,
        }
    }

    pub fn subscribe(&self, observer: impl StoreObserver + 'static) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        lock(&self.observers).push((id, Arc::new(observer)));
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = lock(&self.observers);
        let before = observers.len();
        observers.retain(|(observer_id, _)| *observer_id != id);
        observers.len() != before
    }

    /// Async alternative to [`subscribe`](Self::subscribe): yields the latest
    /// snapshot after each mutation.
    pub fn watch(&self) -> watch::Receiver<StoreSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        lock(&self.state).clone()
    }

    // ---- draft ----

    /// Replace the draft with a fresh one and return it.
    pub fn create_draft(&self) -> DraftRequest {
        self.commit(|state| {
            state.draft = DraftRequest::default();
            (state.draft.clone(), Some(StoreEvent::DraftReset))
        })
    }

    pub fn draft(&self) -> DraftRequest {
        lock(&self.state).draft.clone()
    }

    pub fn update_draft(&self, patch: DraftPatch) -> bool {
        self.commit(|state| {
            let changed = state.draft.merge(patch);
            (changed, changed.then_some(StoreEvent::DraftUpdated))
        })
    }

    // ---- jobs ----

    /// Add a newly submitted record to history and make it the active job.
    ///
    /// A record a history refresh already brought in is adopted instead:
    /// it moves to the tail, takes whatever the new record adds to it and
    /// becomes active. Appending an id twice is an error.
    pub fn append(&self, record: JobRecord) -> Result<(), StoreError> {
        self.commit(|state| {
            let Some(id) = record.id.clone() else {
                return (Err(StoreError::MissingId), None);
            };

            let record = match state.position(&id) {
                None => record,
                Some(at) if at < state.fetched_len() => {
                    let mut known = state.history.remove(at);
                    if let Err(e) = known.apply(&JobPatch::from(&record)) {
                        debug!(job_id = %id, "Keeping fetched state of adopted job: {}", e);
                    }
                    known
                }
                Some(_) => return (Err(StoreError::DuplicateId(id)), None),
            };

            state.history.push(record);
            state.appended += 1;
            state.active_id = Some(id.clone());
            (Ok(()), Some(StoreEvent::JobAppended(id)))
        })
    }

    pub fn patch(&self, id: &JobId, patch: &JobPatch) -> PatchOutcome {
        self.commit(|state| Self::patch_in(state, id, patch))
    }

    /// Like [`patch`](Self::patch), but only while `id` is the active job.
    /// The check and the write happen under one lock.
    pub fn patch_active(&self, id: &JobId, patch: &JobPatch) -> Result<PatchOutcome, StaleUpdateError> {
        self.commit(|state| {
            if state.active_id.as_ref() != Some(id) {
                return (Err(StaleUpdateError { job_id: id.clone() }), None);
            }
            let (outcome, event) = Self::patch_in(state, id, patch);
            (Ok(outcome), event)
        })
    }

    fn patch_in(state: &mut StoreSnapshot, id: &JobId, patch: &JobPatch) -> (PatchOutcome, Option<StoreEvent>) {
        let Some(job) = state.history.iter_mut().find(|job| job.is_id(id)) else {
            debug!(job_id = %id, "Ignoring patch for unknown job");
            return (PatchOutcome::UnknownJob, None);
        };

        match job.apply(patch) {
            Ok(true) => {
                let event = StoreEvent::JobPatched { job_id: id.clone(), status: job.status };
                (PatchOutcome::Applied, Some(event))
            }
            Ok(false) => (PatchOutcome::Unchanged, None),
            Err(e) => {
                warn!(job_id = %id, "Rejected job update: {}", e);
                (PatchOutcome::Rejected(e), None)
            }
        }
    }

    pub fn most_recent(&self) -> Option<JobRecord> {
        lock(&self.state).most_recent().cloned()
    }

    pub fn active(&self) -> Option<JobRecord> {
        lock(&self.state).active().cloned()
    }

    pub fn active_id(&self) -> Option<JobId> {
        lock(&self.state).active_id.clone()
    }

    pub fn job(&self, id: &JobId) -> Option<JobRecord> {
        lock(&self.state).job(id).cloned()
    }

    pub fn history(&self) -> Vec<JobRecord> {
        lock(&self.state).history.clone()
    }

    /// Add records fetched from the service that this session does not
    /// know yet, ordered by creation time ahead of the appended records.
    /// Known records and the active job are left untouched.
    pub fn merge_history(&self, records: Vec<JobRecord>) -> usize {
        self.commit(|state| {
            let mut added = 0;
            for record in records {
                let Some(id) = record.id.as_ref() else {
                    continue;
                };
                if state.job(id).is_some() {
                    continue;
                }
                let fetched = state.fetched_len();
                let at = state.history[..fetched]
                    .partition_point(|known| known.created_at <= record.created_at);
                state.history.insert(at, record);
                added += 1;
            }
            (added, (added > 0).then_some(StoreEvent::HistoryMerged { added }))
        })
    }

    // ---- private helpers ----

    fn commit<R>(&self, mutate: impl FnOnce(&mut StoreSnapshot) -> (R, Option<StoreEvent>)) -> R {
        let _dispatch = lock(&self.dispatch);

        let (result, committed) = {
            let mut state = lock(&self.state);
            let (result, event) = mutate(&mut state);
            let committed = event.map(|event| {
                state.revision += 1;
                (event, state.clone())
            });
            (result, committed)
        };

        if let Some((event, snapshot)) = committed {
            self.notify(&event, snapshot);
        }

        result
    }

    fn notify(&self, event: &StoreEvent, snapshot: StoreSnapshot) {
        let observers: Vec<Arc<dyn StoreObserver>> = lock(&self.observers)
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();

        for observer in observers {
            observer.on_change(event, &snapshot);
        }

        self.snapshots.send_replace(snapshot);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
