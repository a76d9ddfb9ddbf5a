//! Persistent, append-only, strictly-timestamp-ordered typed streams.
//!
//! A stream owns its persister, serialises all publishes behind a single
//! publisher gate, and fans entries out to subscribers, each running in a
//! dedicated worker thread. Subscribers are bound to a [`SubscriberScope`];
//! dropping the scope signals and joins the worker. Dropping the stream
//! itself wakes every worker and waits for all of them to exit before the
//! persister goes away.

pub mod http;
pub mod persist;
pub mod schema;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, Weak};
use std::thread::JoinHandle;

use thiserror::Error;

use crate::sync_util::{lock, wait};
use crate::time::TimeSource;
pub use persist::{Entry, FilePersister, IdxTs, MemoryPersister, PersistError, Persister,
                  StreamPersister, SyncMode};
pub use schema::{DescribeSchema, SchemaFormatNotFound, StreamSchema};

/// Everything a payload type needs to flow through a stream.
pub trait StreamEntry:
    Clone
    + Send
    + Sync
    + serde::Serialize
    + serde::de::DeserializeOwned
    + DescribeSchema
    + 'static
{
}

impl<T> StreamEntry for T where
    T: Clone
        + Send
        + Sync
        + serde::Serialize
        + serde::de::DeserializeOwned
        + DescribeSchema
        + 'static
{
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream is in graceful shutdown")]
    ShuttingDown,
    #[error("publish on a stream whose publisher has been moved out")]
    PublisherReleased,
    #[error("stream already owns a publisher")]
    PublisherAlreadyOwned,
    #[error("publisher has already been released")]
    PublisherAlreadyReleased,
    #[error("failed to spawn subscriber worker: {0}")]
    SpawnWorker(#[source] std::io::Error),
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Whether the stream itself holds its publisher or has transferred it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataAuthority {
    Own,
    External,
}

/// Subscriber verdict after each delivered entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryResponse {
    More,
    Done,
}

/// Subscriber verdict when asked to terminate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationResponse {
    Wait,
    Terminate,
}

/// A stream subscriber. Runs on a dedicated worker thread; entries arrive in
/// strictly ascending index order.
pub trait StreamSubscriber<E>: Send + 'static {
    fn on_entry(&mut self, entry: Entry<E>, last: IdxTs) -> EntryResponse;

    /// Type filter: entries for which this returns `false` are not delivered;
    /// `on_no_more_entries_of_interest` is consulted instead.
    fn accepts(&self, _entry: &E) -> bool {
        true
    }

    fn on_no_more_entries_of_interest(&mut self) -> EntryResponse {
        EntryResponse::More
    }

    /// Called once when termination is requested. `Wait` keeps the worker
    /// draining entries; anything else ends it.
    fn on_terminate(&mut self) -> TerminationResponse {
        TerminationResponse::Terminate
    }
}

/// Receiver side of [`Stream::move_publisher_to`].
pub trait PublisherAcquirer<E: StreamEntry> {
    fn accept_publisher(&mut self, publisher: StreamPublisher<E>);
}

struct PubState {
    size: u64,
}

/// Shared stream state: the persister plus everything subscribers touch.
pub(crate) struct StreamCore<E: StreamEntry> {
    persister: RwLock<StreamPersister<E>>,
    /// The publish mutex: serialises appends and pairs with `publish_cv`.
    pub_state: Mutex<PubState>,
    publish_cv: Condvar,
    /// Lock-free mirror of `pub_state.size` for subscriber polling.
    size: AtomicU64,
    in_destruction: AtomicBool,
    /// Live subscriber workers; guarded handshake with `Stream::drop`.
    workers: Mutex<usize>,
    worker_exit_cv: Condvar,
    http_subscriptions: Mutex<HashMap<String, SubscriberScope>>,
    schema: StreamSchema,
    clock: Arc<dyn TimeSource>,
}

impl<E: StreamEntry> StreamCore<E> {
    fn new(persister: StreamPersister<E>, clock: Arc<dyn TimeSource>) -> Self {
        let size = persister.size();
        Self {
            persister: RwLock::new(persister),
            pub_state: Mutex::new(PubState { size }),
            publish_cv: Condvar::new(),
            size: AtomicU64::new(size),
            in_destruction: AtomicBool::new(false),
            workers: Mutex::new(0),
            worker_exit_cv: Condvar::new(),
            http_subscriptions: Mutex::new(HashMap::new()),
            schema: StreamSchema::of::<E>(),
            clock,
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.in_destruction.load(Ordering::SeqCst)
    }

    pub(crate) fn schema(&self) -> &StreamSchema {
        &self.schema
    }

    pub(crate) fn last_published(&self) -> Option<IdxTs> {
        self.persister
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_published()
    }

    pub(crate) fn with_persister<R>(&self, f: impl FnOnce(&StreamPersister<E>) -> R) -> R {
        f(&self.persister.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn read_batch(&self, begin: u64, end: u64) -> Result<Vec<Entry<E>>, PersistError> {
        self.with_persister(|p| p.iterate(begin, end).collect())
    }

    /// The publish critical section. `us = None` stamps the entry with
    /// "now", nudged forward if the clock has not advanced past the last
    /// published timestamp; an explicit `us` is never adjusted.
    fn do_publish(&self, entry: E, us: Option<u64>) -> Result<IdxTs, StreamError> {
        if self.is_shutting_down() {
            return Err(StreamError::ShuttingDown);
        }
        let mut state = lock(&self.pub_state);
        let result = {
            let mut persister = self
                .persister
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let us = us.unwrap_or_else(|| {
                let floor = persister
                    .last_published()
                    .map(|last| last.us + 1)
                    .unwrap_or(0);
                self.clock.now_us().max(floor)
            });
            persister.publish(entry, us)?
        };
        state.size = result.index;
        self.size.store(result.index, Ordering::SeqCst);
        self.publish_cv.notify_all();
        Ok(result)
    }

    fn subscribe_impl<S: StreamSubscriber<E>>(
        self: &Arc<Self>,
        mut subscriber: S,
        done: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<SubscriberScope, StreamError> {
        {
            let mut workers = lock(&self.workers);
            if self.is_shutting_down() {
                return Err(StreamError::ShuttingDown);
            }
            *workers += 1;
        }

        let terminate = Arc::new(AtomicBool::new(false));
        let core = Arc::clone(self);
        let worker_flag = Arc::clone(&terminate);
        let spawned = std::thread::Builder::new()
            .name("stream-subscriber".to_string())
            .spawn(move || {
                let _exit = WorkerExitGuard { core: Arc::clone(&core) };
                worker_loop(&core, &worker_flag, &mut subscriber);
                if let Some(done) = done {
                    done();
                }
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                let mut workers = lock(&self.workers);
                *workers -= 1;
                self.worker_exit_cv.notify_all();
                return Err(StreamError::SpawnWorker(err));
            }
        };

        let weak = Arc::downgrade(self);
        let wake = Box::new(move || {
            if let Some(core) = weak.upgrade() {
                let _state = lock(&core.pub_state);
                core.publish_cv.notify_all();
            }
        });
        Ok(SubscriberScope {
            inner: Some(ScopeInner {
                terminate,
                wake,
                handle,
            }),
        })
    }

    pub(crate) fn register_http_subscription(&self, id: String, scope: SubscriberScope) {
        let mut subscriptions = lock(&self.http_subscriptions);
        subscriptions.entry(id).or_insert(scope);
    }

    /// Removes (and thereby terminates) an HTTP subscription. Also invoked
    /// from the subscriber's own done-callback, which is why the scope is
    /// dropped outside the map lock: a scope dropped on its own worker
    /// thread detaches instead of joining.
    pub(crate) fn terminate_http_subscription(&self, id: &str) -> bool {
        let scope = lock(&self.http_subscriptions).remove(id);
        match scope {
            Some(scope) => {
                drop(scope);
                true
            }
            None => false,
        }
    }

    fn shutdown(&self) {
        self.in_destruction.store(true, Ordering::SeqCst);
        let scopes: Vec<SubscriberScope> = {
            let mut subscriptions = lock(&self.http_subscriptions);
            subscriptions.drain().map(|(_, scope)| scope).collect()
        };
        drop(scopes);
        {
            let _state = lock(&self.pub_state);
            self.publish_cv.notify_all();
        }
        let mut workers = lock(&self.workers);
        while *workers > 0 {
            workers = wait(&self.worker_exit_cv, workers);
        }
    }
}

struct WorkerExitGuard<E: StreamEntry> {
    core: Arc<StreamCore<E>>,
}

impl<E: StreamEntry> Drop for WorkerExitGuard<E> {
    fn drop(&mut self) {
        let mut workers = lock(&self.core.workers);
        *workers -= 1;
        self.core.worker_exit_cv.notify_all();
    }
}

fn worker_loop<E: StreamEntry, S: StreamSubscriber<E>>(
    core: &Arc<StreamCore<E>>,
    terminate: &AtomicBool,
    subscriber: &mut S,
) {
    let mut next: u64 = 0;
    let mut terminate_sent = false;
    let terminated =
        || terminate.load(Ordering::SeqCst) || core.in_destruction.load(Ordering::SeqCst);

    loop {
        if !terminate_sent && terminated() {
            terminate_sent = true;
            if subscriber.on_terminate() != TerminationResponse::Wait {
                return;
            }
        }
        let size = core.size();
        if size > next {
            let batch = match core.read_batch(next, size) {
                Ok(batch) => batch,
                Err(err) => {
                    // An I/O failure ends this subscriber only.
                    tracing::warn!(error = %err, "subscriber replay failed");
                    return;
                }
            };
            for entry in batch {
                if !terminate_sent && terminated() {
                    terminate_sent = true;
                    if subscriber.on_terminate() != TerminationResponse::Wait {
                        return;
                    }
                }
                let last = core.last_published().unwrap_or_else(|| entry.idx_ts());
                let response = if subscriber.accepts(&entry.entry) {
                    subscriber.on_entry(entry, last)
                } else {
                    subscriber.on_no_more_entries_of_interest()
                };
                if response == EntryResponse::Done {
                    return;
                }
            }
            next = size;
        } else {
            let mut state = lock(&core.pub_state);
            while !((terminated() && !terminate_sent) || state.size > next) {
                state = wait(&core.publish_cv, state);
            }
        }
    }
}

/// RAII owner of one subscriber worker. Dropping it signals termination and
/// joins the worker; a scope dropped on the worker's own thread detaches.
pub struct SubscriberScope {
    inner: Option<ScopeInner>,
}

struct ScopeInner {
    terminate: Arc<AtomicBool>,
    wake: Box<dyn Fn() + Send + Sync>,
    handle: JoinHandle<()>,
}

impl Drop for SubscriberScope {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        inner.terminate.store(true, Ordering::SeqCst);
        (inner.wake)();
        if inner.handle.thread().id() != std::thread::current().id() {
            let _ = inner.handle.join();
        }
    }
}

/// Exclusive write capability for one stream. Obtained by the stream itself
/// at construction, or by an external holder via `move_publisher_to`.
pub struct StreamPublisher<E: StreamEntry> {
    core: Arc<StreamCore<E>>,
}

impl<E: StreamEntry> StreamPublisher<E> {
    pub fn publish(&self, entry: E) -> Result<IdxTs, StreamError> {
        self.core.do_publish(entry, None)
    }

    pub fn publish_at(&self, entry: E, us: u64) -> Result<IdxTs, StreamError> {
        self.core.do_publish(entry, Some(us))
    }
}

struct PublisherSlot<E: StreamEntry> {
    publisher: Option<StreamPublisher<E>>,
    authority: DataAuthority,
}

/// A typed stream over a memory- or file-backed persister.
pub struct Stream<E: StreamEntry> {
    core: Arc<StreamCore<E>>,
    /// The publisher handle mutex: guards the slot and the authority flag.
    publisher: Mutex<PublisherSlot<E>>,
}

impl<E: StreamEntry> Stream<E> {
    pub fn memory(clock: Arc<dyn TimeSource>) -> Self {
        Self::with_persister(StreamPersister::Memory(MemoryPersister::new()), clock)
    }

    pub fn file(
        path: impl AsRef<std::path::Path>,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self, PersistError> {
        let persister = FilePersister::open(path)?;
        Ok(Self::with_persister(StreamPersister::File(persister), clock))
    }

    pub fn with_persister(persister: StreamPersister<E>, clock: Arc<dyn TimeSource>) -> Self {
        let core = Arc::new(StreamCore::new(persister, clock));
        let publisher = StreamPublisher {
            core: Arc::clone(&core),
        };
        Self {
            core,
            publisher: Mutex::new(PublisherSlot {
                publisher: Some(publisher),
                authority: DataAuthority::Own,
            }),
        }
    }

    /// Publishes with a "now" timestamp. Fails with `PublisherReleased` when
    /// the publisher has been moved out, `ShuttingDown` during teardown.
    pub fn publish(&self, entry: E) -> Result<IdxTs, StreamError> {
        let slot = lock(&self.publisher);
        match &slot.publisher {
            Some(publisher) => publisher.core.do_publish(entry, None),
            None => Err(StreamError::PublisherReleased),
        }
    }

    /// Publishes with an explicit timestamp, which must strictly exceed the
    /// last published one.
    pub fn publish_at(&self, entry: E, us: u64) -> Result<IdxTs, StreamError> {
        let slot = lock(&self.publisher);
        match &slot.publisher {
            Some(publisher) => publisher.core.do_publish(entry, Some(us)),
            None => Err(StreamError::PublisherReleased),
        }
    }

    pub fn subscribe<S: StreamSubscriber<E>>(
        &self,
        subscriber: S,
    ) -> Result<SubscriberScope, StreamError> {
        self.core.subscribe_impl(subscriber, None)
    }

    pub fn subscribe_with_done<S: StreamSubscriber<E>>(
        &self,
        subscriber: S,
        done: impl FnOnce() + Send + 'static,
    ) -> Result<SubscriberScope, StreamError> {
        self.core.subscribe_impl(subscriber, Some(Box::new(done)))
    }

    /// Hands the publisher to an external holder. The stream's own `publish`
    /// fails with `PublisherReleased` until `acquire_publisher` returns it.
    pub fn move_publisher_to<A: PublisherAcquirer<E>>(
        &self,
        acquirer: &mut A,
    ) -> Result<(), StreamError> {
        let mut slot = lock(&self.publisher);
        match slot.publisher.take() {
            Some(publisher) => {
                acquirer.accept_publisher(publisher);
                slot.authority = DataAuthority::External;
                Ok(())
            }
            None => Err(StreamError::PublisherAlreadyReleased),
        }
    }

    pub fn acquire_publisher(&self, publisher: StreamPublisher<E>) -> Result<(), StreamError> {
        let mut slot = lock(&self.publisher);
        if slot.publisher.is_some() {
            return Err(StreamError::PublisherAlreadyOwned);
        }
        slot.publisher = Some(publisher);
        slot.authority = DataAuthority::Own;
        Ok(())
    }

    pub fn data_authority(&self) -> DataAuthority {
        lock(&self.publisher).authority
    }

    pub fn schema(&self) -> &StreamSchema {
        self.core.schema()
    }

    pub fn size(&self) -> u64 {
        self.core.size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn last_published(&self) -> Option<IdxTs> {
        self.core.last_published()
    }

    /// Read access to the underlying persister, for replay-style consumers.
    pub fn with_persister_read<R>(&self, f: impl FnOnce(&StreamPersister<E>) -> R) -> R {
        self.core.with_persister(f)
    }

    /// A weak handle suitable for handing to the HTTP layer: it does not
    /// keep the stream alive, and all operations fail once it is gone.
    pub fn handle(&self) -> StreamHandle<E> {
        StreamHandle {
            core: Arc::downgrade(&self.core),
        }
    }
}

impl<E: StreamEntry> Drop for Stream<E> {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

/// Weak reference to a stream's shared state.
#[derive(Clone)]
pub struct StreamHandle<E: StreamEntry> {
    core: Weak<StreamCore<E>>,
}

impl<E: StreamEntry> StreamHandle<E> {
    pub(crate) fn upgrade(&self) -> Option<Arc<StreamCore<E>>> {
        self.core.upgrade()
    }
}
