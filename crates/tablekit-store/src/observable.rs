//! Live values derived from one table.
//!
//! An [`Observable`] runs a producer against a [`Database`] once on creation
//! and again after every mutation of its table, then hands the result to
//! its subscribers.
//!
//! ```text
//! INITIALIZING ──first recompute settles──► LIVE ──destroy()/drop──► DESTROYED
//! ```
//!
//! # Overlapping recomputes
//!
//! Every trigger takes a generation number. A finished recompute is only
//! published while its generation is still the latest one triggered, so a
//! slow, older recompute never overwrites a newer result.
//!
//! # Example
//!
//! ```
//! use tablekit_migrate::{SchemaModel, TableDefinition};
//! use tablekit_store::{Database, MemoryEngine, Observable};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let model = SchemaModel::create([("notes", TableDefinition::auto_keyed())]);
//! let db = Database::open(&MemoryEngine::new(), "app", model).unwrap();
//!
//! let notes = Observable::<Vec<String>>::create(&db, "notes").unwrap();
//! assert_eq!(notes.value().await, Some(vec![]));
//!
//! db.add("notes", &"buy milk").unwrap();
//! assert_eq!(notes.value().await, Some(vec!["buy milk".to_string()]));
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::db::Database;
use crate::error::DbError;
use crate::listeners::{Registry, Subscription};
use crate::traits::StorageEngine;

type Recompute<T> = Pin<Box<dyn Future<Output = Result<T, DbError>> + Send>>;
type Producer<T> = Arc<dyn Fn() -> Recompute<T> + Send + Sync>;
type ValueListener<T> = dyn Fn(&T) + Send + Sync;
type ErrorListener = dyn Fn(&DbError) + Send + Sync;

/// Lifecycle of an [`Observable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservableState {
    /// The first recompute has not settled yet.
    Initializing,
    /// At least one recompute has settled.
    Live,
    /// Destroyed; no further recomputes or broadcasts.
    Destroyed,
}

struct Settled<T> {
    generation: u64,
    value: Option<T>,
    destroyed: bool,
}

struct Shared<T: Send + Sync + 'static> {
    table: String,
    producer: Producer<T>,
    runtime: Handle,
    triggered: AtomicU64,
    destroyed: AtomicBool,
    settled: watch::Sender<Settled<T>>,
    subscribers: Arc<Registry<ValueListener<T>>>,
    errors: Arc<Registry<ErrorListener>>,
    settle_lock: Mutex<()>,
    db_subscription: Mutex<Option<Subscription>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Clone + Send + Sync + 'static> Shared<T> {
    fn trigger(self: &Arc<Self>) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let generation = self.triggered.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(table = %self.table, generation, "recompute triggered");
        let recompute = (self.producer)();
        let shared = Arc::downgrade(self);
        self.runtime.spawn(async move {
            let result = recompute.await;
            if let Some(shared) = shared.upgrade() {
                shared.settle(generation, result);
            }
        });
    }

    fn settle(&self, generation: u64, result: Result<T, DbError>) {
        let _guard = lock(&self.settle_lock);
        if self.destroyed.load(Ordering::Acquire) {
            debug!(table = %self.table, generation, "dropping recompute of destroyed observable");
            return;
        }
        if generation < self.triggered.load(Ordering::Acquire) {
            debug!(table = %self.table, generation, "dropping superseded recompute");
            return;
        }

        match result {
            Ok(value) => {
                for subscriber in self.subscribers.snapshot() {
                    if self.destroyed.load(Ordering::Acquire) {
                        return;
                    }
                    subscriber(&value);
                }
                self.publish(generation, Some(value));
            }
            Err(error) => {
                warn!(table = %self.table, generation, %error, "recompute failed");
                for listener in self.errors.snapshot() {
                    if self.destroyed.load(Ordering::Acquire) {
                        return;
                    }
                    listener(&error);
                }
                self.publish(generation, None);
            }
        }
    }

    /// Record a settled generation. `None` keeps the previous value.
    fn publish(&self, generation: u64, value: Option<T>) {
        self.settled.send_modify(|settled| {
            settled.generation = generation;
            if value.is_some() {
                settled.value = value;
            }
        });
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(subscription) = lock(&self.db_subscription).take() {
            subscription.unsubscribe();
        }
        self.subscribers.clear();
        self.errors.clear();
        self.settled.send_modify(|settled| settled.destroyed = true);
        debug!(table = %self.table, "observable destroyed");
    }
}

/// A value recomputed whenever its table changes.
///
/// Dropping the observable destroys it.
pub struct Observable<T: Clone + Send + Sync + 'static> {
    shared: Arc<Shared<T>>,
}

impl<V> Observable<Vec<V>>
where
    V: DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Observe every value of `table`, in key order.
    pub fn create<E: StorageEngine>(db: &Database<E>, table: &str) -> Result<Self, DbError> {
        let name = table.to_string();
        Self::with_producer(db, table, move |db: Database<E>| {
            let name = name.clone();
            async move { db.get_all::<V>(&name) }
        })
    }
}

impl<T: Clone + Send + Sync + 'static> Observable<T> {
    /// Observe `table` through a custom producer.
    ///
    /// The producer runs once immediately and again after every mutation of
    /// `table`. It must be called from within a tokio runtime, which is used
    /// for every recompute.
    pub fn with_producer<E, F, Fut>(db: &Database<E>, table: &str, produce: F) -> Result<Self, DbError>
    where
        E: StorageEngine,
        F: Fn(Database<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, DbError>> + Send + 'static,
    {
        if db.model().table(table).is_none() {
            return Err(DbError::UnknownTable(table.to_string()));
        }
        let runtime = Handle::try_current().map_err(|_| DbError::NoRuntime)?;

        let source = db.clone();
        let producer: Producer<T> = Arc::new(move || -> Recompute<T> { Box::pin(produce(source.clone())) });
        let (settled, _) = watch::channel(Settled {
            generation: 0,
            value: None,
            destroyed: false,
        });
        let shared = Arc::new(Shared {
            table: table.to_string(),
            producer,
            runtime,
            triggered: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            settled,
            subscribers: Registry::new(),
            errors: Registry::new(),
            settle_lock: Mutex::new(()),
            db_subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&shared);
        let watched = table.to_string();
        let subscription = db.subscribe(move |mutated| {
            if mutated != watched {
                return;
            }
            if let Some(shared) = weak.upgrade() {
                shared.trigger();
            }
        });
        *lock(&shared.db_subscription) = Some(subscription);

        shared.trigger();
        Ok(Self { shared })
    }

    /// The observed table.
    pub fn table(&self) -> &str {
        &self.shared.table
    }

    /// Register a callback for every new value.
    ///
    /// Callbacks run in registration order. Registering on a destroyed
    /// observable returns an inactive subscription.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let subscription = self.shared.subscribers.register(Arc::new(callback));
        if self.shared.destroyed.load(Ordering::Acquire) {
            subscription.unsubscribe();
        }
        subscription
    }

    /// Register a callback for failed recomputes.
    pub fn subscribe_errors<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DbError) + Send + Sync + 'static,
    {
        let subscription = self.shared.errors.register(Arc::new(callback));
        if self.shared.destroyed.load(Ordering::Acquire) {
            subscription.unsubscribe();
        }
        subscription
    }

    /// Wait for the latest triggered recompute to settle, then return the
    /// current value.
    ///
    /// Returns immediately on a destroyed observable. `None` means no
    /// recompute has succeeded yet.
    pub async fn value(&self) -> Option<T> {
        let target = self.shared.triggered.load(Ordering::Acquire);
        let mut receiver = self.shared.settled.subscribe();
        let value = match receiver.wait_for(|s| s.destroyed || s.generation >= target).await {
            Ok(settled) => settled.value.clone(),
            Err(_) => None,
        };
        value.or_else(|| self.current())
    }

    /// The current value, without waiting.
    pub fn current(&self) -> Option<T> {
        self.shared.settled.borrow().value.clone()
    }

    /// Lifecycle state.
    pub fn state(&self) -> ObservableState {
        let settled = self.shared.settled.borrow();
        if settled.destroyed {
            ObservableState::Destroyed
        } else if settled.generation == 0 {
            ObservableState::Initializing
        } else {
            ObservableState::Live
        }
    }

    /// Release the table subscription and every subscriber. A recompute
    /// still in flight completes without effect. Calling twice is a no-op.
    pub fn destroy(&self) {
        self.shared.destroy();
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for Observable<T> {
    fn drop(&mut self) {
        self.shared.destroy();
    }
}

impl<T: Clone + Send + Sync + 'static> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("table", &self.shared.table)
            .field("state", &self.state())
            .field("triggered", &self.shared.triggered.load(Ordering::Relaxed))
            .field("subscribers", &self.shared.subscribers.len())
            .finish()
    }
}
