//! # Background Workers
//!
//! Every caller-visible request runs as one job on a dedicated worker thread.
//! The caller keeps a [`RequestHandle`], a single-consumer completion channel;
//! dropping the handle cancels the request. Jobs that have not started are
//! skipped, and a running save stops before its next sub-batch.
//!
//! [`ContactWatcher`] keeps one contact loaded: it reloads whenever the store
//! reports a commit and unregisters its store observer when dropped.

use crate::assembler::ContactAssembler;
use crate::config::{WorkerConfig, WORKER_POLL_INTERVAL_MS};
use crate::error::{ContactError, ContactResult};
use crate::model::{Contact, ContactRef, LoadResult};
use crate::notify::{Broadcast, NotificationGateway};
use crate::photo::load_display_photo;
use crate::store::{ContactStore, ObserverId, StoreChange};
use anyhow::anyhow;
use crossbeam_channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

fn poll_interval() -> Duration {
    Duration::from_millis(WORKER_POLL_INTERVAL_MS)
}

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// What a queued request does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Load,
    Save,
    Join,
    JoinSeveral,
    Split,
    CreateGroup,
    RenameGroup,
    UpdateGroup,
    DeleteGroup,
    UndoGroup,
    Edit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Requests queued or running, in submission order.
pub struct ServiceState {
    pending: Mutex<Vec<(RequestId, RequestKind)>>,
    gateway: Arc<NotificationGateway>,
}

impl ServiceState {
    pub fn new(gateway: Arc<NotificationGateway>) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            gateway,
        }
    }

    fn start(&self, id: RequestId, kind: RequestKind) {
        let pending = {
            let mut guard = self.pending.lock();
            guard.push((id, kind));
            kinds(&guard)
        };
        self.gateway
            .broadcast(Broadcast::ServiceStateChanged { pending });
    }

    fn finish(&self, id: RequestId) {
        let pending = {
            let mut guard = self.pending.lock();
            let Some(index) = guard.iter().position(|(pending, _)| *pending == id) else {
                return;
            };
            guard.remove(index);
            kinds(&guard)
        };
        self.gateway
            .broadcast(Broadcast::ServiceStateChanged { pending });
    }

    pub fn is_idle(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn is_pending(&self, kind: RequestKind) -> bool {
        self.pending.lock().iter().any(|(_, pending)| *pending == kind)
    }

    pub fn pending(&self) -> Vec<RequestKind> {
        kinds(&self.pending.lock())
    }
}

fn kinds(pending: &[(RequestId, RequestKind)]) -> Vec<RequestKind> {
    pending.iter().map(|(_, kind)| *kind).collect()
}

/// Runs `work`, converting a panic into [`ContactError::Error`].
pub fn run_guarded<T>(work: impl FnOnce() -> ContactResult<T>) -> ContactResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(%message, "worker job panicked");
            Err(ContactError::Error(anyhow!("worker job panicked: {message}")))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Completion channel for one request. Dropping it cancels the request.
pub struct RequestHandle<T> {
    id: RequestId,
    kind: RequestKind,
    receiver: Receiver<ContactResult<T>>,
    cancel: CancelToken,
}

impl<T> RequestHandle<T> {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Blocks until the request finishes.
    pub fn wait(self) -> ContactResult<T> {
        match self.receiver.recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(self.abandoned()),
        }
    }

    /// `None` when the request is still running after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ContactResult<T>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(self.abandoned())),
        }
    }

    pub fn try_result(&self) -> Option<ContactResult<T>> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(self.abandoned())),
        }
    }

    fn abandoned(&self) -> ContactError {
        ContactError::Error(anyhow!("{} ({:?}) ended without an outcome", self.id, self.kind))
    }
}

impl<T> Drop for RequestHandle<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

type Task = Box<dyn FnOnce(&CancelToken) + Send>;

struct Job {
    id: RequestId,
    kind: RequestKind,
    cancel: CancelToken,
    task: Task,
}

/// Single worker thread draining a bounded job queue in order.
pub struct ContactService {
    tx: Option<Sender<Job>>,
    sequence: AtomicU64,
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    state: Arc<ServiceState>,
}

impl ContactService {
    pub fn start(config: &WorkerConfig, gateway: Arc<NotificationGateway>) -> ContactResult<Self> {
        let (tx, rx) = crossbeam_channel::bounded(config.queue_capacity.max(1));
        let shutdown = Arc::new(AtomicBool::new(false));
        let state = Arc::new(ServiceState::new(gateway));

        let worker_shutdown = Arc::clone(&shutdown);
        let worker_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || worker_loop(rx, worker_shutdown, worker_state))
            .map_err(|err| ContactError::Error(anyhow!("failed to spawn worker: {err}")))?;
        info!(thread = %config.thread_name, "contact service started");

        Ok(Self {
            tx: Some(tx),
            sequence: AtomicU64::new(0),
            handle: Some(handle),
            shutdown,
            state,
        })
    }

    pub fn state(&self) -> &Arc<ServiceState> {
        &self.state
    }

    /// Queues `work`. Blocks while the queue is full.
    pub fn submit<T, F>(&self, kind: RequestKind, work: F) -> ContactResult<RequestHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> ContactResult<T> + Send + 'static,
    {
        let id = RequestId(self.sequence.fetch_add(1, Ordering::Relaxed) + 1);
        let (done, receiver) = crossbeam_channel::bounded(1);
        let cancel = CancelToken::new();
        let task: Task = Box::new(move |cancel: &CancelToken| {
            let outcome = run_guarded(|| work(cancel));
            if done.send(outcome).is_err() {
                debug!(request = %id, "requester went away before completion");
            }
        });
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| ContactError::Error(anyhow!("contact service is shut down")))?;
        self.state.start(id, kind);
        let job = Job {
            id,
            kind,
            cancel: cancel.clone(),
            task,
        };
        if tx.send(job).is_err() {
            self.state.finish(id);
            return Err(ContactError::Error(anyhow!("contact service is shut down")));
        }
        trace!(request = %id, ?kind, "request queued");
        Ok(RequestHandle {
            id,
            kind,
            receiver,
            cancel,
        })
    }

    pub fn pending(&self) -> usize {
        self.tx.as_ref().map_or(0, Sender::len)
    }
}

impl Drop for ContactService {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: Receiver<Job>, shutdown: Arc<AtomicBool>, state: Arc<ServiceState>) {
    loop {
        if shutdown.load(Ordering::Acquire) && rx.is_empty() {
            break;
        }
        match rx.recv_timeout(poll_interval()) {
            Ok(job) => {
                if job.cancel.is_cancelled() {
                    debug!(request = %job.id, kind = ?job.kind, "skipping cancelled request");
                } else {
                    (job.task)(&job.cancel);
                }
                state.finish(job.id);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("contact service stopped");
}

struct PhotoJob {
    contact: Arc<Contact>,
    deliver: Sender<LoadResult>,
}

/// Secondary worker that reads full-size photos after the structural result
/// was delivered, then delivers a new snapshot carrying the bytes.
pub struct PhotoWorker {
    tx: Option<Sender<PhotoJob>>,
    handle: Option<JoinHandle<()>>,
}

impl PhotoWorker {
    pub fn start(
        config: &WorkerConfig,
        store: Arc<dyn ContactStore>,
        max_photo_bytes: usize,
    ) -> ContactResult<Self> {
        let (tx, rx) = crossbeam_channel::bounded::<PhotoJob>(config.queue_capacity.max(1));
        let handle = thread::Builder::new()
            .name(config.photo_thread_name.clone())
            .spawn(move || {
                for job in rx.iter() {
                    let photo = load_display_photo(store.as_ref(), &job.contact, max_photo_bytes);
                    if photo.is_none() {
                        continue;
                    }
                    let snapshot = Arc::new(job.contact.with_photo(photo));
                    if job.deliver.send(LoadResult::Loaded(snapshot)).is_err() {
                        trace!("photo consumer went away");
                    }
                }
            })
            .map_err(|err| ContactError::Error(anyhow!("failed to spawn photo worker: {err}")))?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queues a photo read for `contact`; the new snapshot goes to `deliver`.
    pub fn fetch(&self, contact: Arc<Contact>, deliver: Sender<LoadResult>) -> bool {
        match &self.tx {
            Some(tx) => tx.send(PhotoJob { contact, deliver }).is_ok(),
            None => false,
        }
    }
}

impl Drop for PhotoWorker {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Keeps one contact loaded and delivers a fresh snapshot after every store
/// commit.
pub struct ContactWatcher {
    results: Receiver<LoadResult>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ContactWatcher {
    pub fn start(
        config: &WorkerConfig,
        assembler: ContactAssembler,
        reference: ContactRef,
        photos: Option<Arc<PhotoWorker>>,
    ) -> ContactResult<Self> {
        let (deliver, results) = crossbeam_channel::unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let watch_shutdown = Arc::clone(&shutdown);
        let buffer = config.watch_buffer.max(1);
        let handle = thread::Builder::new()
            .name(format!("{}-watch", config.thread_name))
            .spawn(move || {
                let mut watch = WatchLoop {
                    assembler,
                    reference,
                    photos,
                    deliver,
                    shutdown: watch_shutdown,
                    observer: None,
                    buffer,
                };
                watch.run();
            })
            .map_err(|err| ContactError::Error(anyhow!("failed to spawn watcher: {err}")))?;
        Ok(Self {
            results,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn results(&self) -> &Receiver<LoadResult> {
        &self.results
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<LoadResult> {
        self.results.recv_timeout(timeout).ok()
    }
}

impl Drop for ContactWatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct WatchLoop {
    assembler: ContactAssembler,
    reference: ContactRef,
    photos: Option<Arc<PhotoWorker>>,
    deliver: Sender<LoadResult>,
    shutdown: Arc<AtomicBool>,
    observer: Option<(ObserverId, Receiver<StoreChange>)>,
    buffer: usize,
}

impl WatchLoop {
    fn run(&mut self) {
        'reload: loop {
            let result = self.assembler.load(&self.reference);
            if let LoadResult::Loaded(contact) = &result {
                // Later loads go through the canonical reference.
                self.reference = contact.lookup.clone();
                if !contact.is_directory_entry() {
                    self.ensure_observer();
                }
                if let Some(photos) = &self.photos {
                    if contact.photo.is_none() && contact.photo_uri.is_some() {
                        photos.fetch(Arc::clone(contact), self.deliver.clone());
                    }
                }
            }
            if self.deliver.send(result).is_err() {
                break;
            }
            loop {
                if self.shutdown.load(Ordering::Acquire) {
                    break 'reload;
                }
                let Some((_, changes)) = &self.observer else {
                    thread::sleep(poll_interval());
                    continue;
                };
                match changes.recv_timeout(poll_interval()) {
                    Ok(change) => {
                        let skipped = changes.try_iter().count();
                        trace!(sequence = change.sequence, skipped, "store changed, reloading");
                        continue 'reload;
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        warn!("store dropped the watcher's observer");
                        self.observer = None;
                    }
                }
            }
        }
        self.release_observer();
    }

    fn ensure_observer(&mut self) {
        if self.observer.is_some() {
            return;
        }
        let (sender, receiver) = crossbeam_channel::bounded(self.buffer);
        let id = self.assembler.store().register_observer(sender);
        debug!(observer = id.0, "watcher observing store");
        self.observer = Some((id, receiver));
    }

    fn release_observer(&mut self) {
        if let Some((id, _)) = self.observer.take() {
            self.assembler.store().unregister_observer(id);
            debug!(observer = id.0, "watcher released observer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::BroadcastTag;
    use std::sync::mpsc;

    fn service() -> (ContactService, Arc<NotificationGateway>) {
        let gateway = Arc::new(NotificationGateway::new());
        let service = ContactService::start(&WorkerConfig::default(), Arc::clone(&gateway)).unwrap();
        (service, gateway)
    }

    #[test]
    fn test_requests_complete_in_order() {
        let (service, _) = service();
        let handles: Vec<_> = (0..5)
            .map(|n| service.submit(RequestKind::Edit, move |_| Ok(n)).unwrap())
            .collect();
        let outcomes: Vec<i32> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        assert_eq!(outcomes, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_panic_becomes_error() {
        let (service, _) = service();
        let handle = service
            .submit::<(), _>(RequestKind::Save, |_| panic!("boom"))
            .unwrap();
        let err = handle.wait().unwrap_err();
        assert_eq!(err.kind(), "error");
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_dropped_handle_cancels_queued_request() {
        let (service, _) = service();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let blocker = service
            .submit(RequestKind::Load, move |_| {
                let _ = release_rx.recv();
                Ok(())
            })
            .unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_in_job = Arc::clone(&ran);
        let queued = service
            .submit(RequestKind::Save, move |_| {
                ran_in_job.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        drop(queued);
        release_tx.send(()).unwrap();
        blocker.wait().unwrap();

        let followup = service.submit(RequestKind::Edit, |_| Ok(())).unwrap();
        followup.wait().unwrap();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_service_state_broadcasts() {
        let (service, gateway) = service();
        let (_, events) = gateway.subscribe(&[BroadcastTag::ServiceStateChanged]);
        service
            .submit(RequestKind::Join, |_| Ok(()))
            .unwrap()
            .wait()
            .unwrap();
        // Finish is broadcast after the outcome is sent, so wait for it.
        let mut seen = Vec::new();
        while let Ok(event) = events.recv_timeout(Duration::from_secs(5)) {
            seen.push(event);
            if seen.len() == 2 {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                Broadcast::ServiceStateChanged {
                    pending: vec![RequestKind::Join]
                },
                Broadcast::ServiceStateChanged { pending: vec![] },
            ]
        );
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
