//! Typed event bus with priority-ordered, pool-bounded dispatch.

use gantry_core::Result;
use parking_lot::RwLock;
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

/// Handler priority. Higher priorities are dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum EventPriority {
    /// Dispatched last.
    Lowest = 0,
    /// Below normal.
    Low = 1,
    /// Default.
    #[default]
    Normal = 2,
    /// Above normal.
    High = 3,
    /// Dispatched first.
    Highest = 4,
}

/// Contract for events flowing through the bus.
///
/// Implementations typically embed an [`EventBase`] and delegate to it.
pub trait ApplicationEvent: Any + Send + Sync {
    /// Downcast access for typed handlers.
    fn as_any(&self) -> &dyn Any;

    /// Whether the event has been cancelled.
    fn cancelled(&self) -> bool {
        false
    }

    /// Cancel the event. No-op for non-cancellable events.
    fn cancel(&self) {}
}

/// Common event bookkeeping: creation timestamp and cancelled flag.
#[derive(Debug)]
pub struct EventBase {
    timestamp: SystemTime,
    cancelled: AtomicBool,
}

impl Default for EventBase {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBase {
    /// Create with the current time and not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timestamp: SystemTime::now(),
            cancelled: AtomicBool::new(false),
        }
    }

    /// When the event was created.
    #[must_use]
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Whether the event has been cancelled.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Mark the event cancelled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Boxed handler invocation.
pub type EventCallback = Arc<dyn Fn(&dyn ApplicationEvent) -> Result<()> + Send + Sync>;

/// A typed handler as handed to [`EventBus::register`].
///
/// Each registration targets exactly one event type by construction.
pub struct HandlerRegistration {
    kind: TypeId,
    kind_name: &'static str,
    priority: EventPriority,
    ignore_cancelled: bool,
    callback: EventCallback,
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("kind", &self.kind_name)
            .field("priority", &self.priority)
            .field("ignore_cancelled", &self.ignore_cancelled)
            .finish()
    }
}

impl HandlerRegistration {
    /// Build a registration for event type `E`.
    #[must_use]
    pub fn new<E, F>(priority: EventPriority, ignore_cancelled: bool, handler: F) -> Self
    where
        E: ApplicationEvent,
        F: Fn(&E) -> Result<()> + Send + Sync + 'static,
    {
        let callback: EventCallback = Arc::new(move |event: &dyn ApplicationEvent| {
            event
                .as_any()
                .downcast_ref::<E>()
                .map_or(Ok(()), &handler)
        });
        Self {
            kind: TypeId::of::<E>(),
            kind_name: type_name::<E>(),
            priority,
            ignore_cancelled,
            callback,
        }
    }
}

struct HandlerRecord {
    owner: String,
    priority: EventPriority,
    ignore_cancelled: bool,
    seq: u64,
    kind_name: &'static str,
    callback: EventCallback,
}

/// Event bus.
///
/// Handlers per event type run in priority-descending order;
/// registration order breaks ties. [`fire`](Self::fire) submits
/// invocations to a fixed worker pool in that order, so execution may
/// interleave; [`fire_sync`](Self::fire_sync) runs inline on the caller.
pub struct EventBus {
    handlers: RwLock<HashMap<TypeId, Vec<HandlerRecord>>>,
    seq: AtomicU64,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("event_types", &self.handlers.read().len())
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::EVENT_POOL_SIZE)
    }
}

impl EventBus {
    /// Create a bus with the given worker pool size.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    /// Register an owner's handlers.
    ///
    /// Within equal priority, handlers keep registration order.
    pub fn register(&self, owner: &str, registrations: Vec<HandlerRegistration>) {
        let mut handlers = self.handlers.write();
        for registration in registrations {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            trace!(
                owner,
                kind = registration.kind_name,
                priority = ?registration.priority,
                "handler registered"
            );
            let list = handlers.entry(registration.kind).or_default();
            list.push(HandlerRecord {
                owner: owner.to_string(),
                priority: registration.priority,
                ignore_cancelled: registration.ignore_cancelled,
                seq,
                kind_name: registration.kind_name,
                callback: registration.callback,
            });
            list.sort_by_key(|record| (std::cmp::Reverse(record.priority), record.seq));
        }
    }

    /// Remove every handler registered by `owner`, across all event
    /// types.
    pub fn unregister(&self, owner: &str) {
        let mut handlers = self.handlers.write();
        for list in handlers.values_mut() {
            list.retain(|record| record.owner != owner);
        }
        handlers.retain(|_, list| !list.is_empty());
    }

    /// Number of handlers registered for event type `E`.
    #[must_use]
    pub fn handler_count<E: ApplicationEvent>(&self) -> usize {
        self.handlers
            .read()
            .get(&TypeId::of::<E>())
            .map_or(0, Vec::len)
    }

    /// Dispatch concurrently on the worker pool.
    ///
    /// Submission order is the handler order; execution across handlers
    /// is not causally ordered. Handler errors and panics are logged and
    /// never stop later handlers.
    pub async fn fire(&self, event: Arc<dyn ApplicationEvent>) {
        let records = self.snapshot(event.as_any().type_id());
        for (owner, kind_name, ignore_cancelled, callback) in records {
            if event.cancelled() && ignore_cancelled {
                continue;
            }
            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                debug!("event bus is shut down, dropping dispatch");
                return;
            };
            let event = Arc::clone(&event);
            self.tracker.spawn(async move {
                let _permit = permit;
                invoke(&owner, kind_name, &callback, event.as_ref());
            });
        }
    }

    /// Dispatch inline on the caller, in handler order.
    ///
    /// The skip rule is re-evaluated per handler, so a handler that
    /// cancels the event suppresses later `ignore_cancelled` handlers.
    pub fn fire_sync(&self, event: &dyn ApplicationEvent) {
        let records = self.snapshot(event.as_any().type_id());
        for (owner, kind_name, ignore_cancelled, callback) in records {
            if event.cancelled() && ignore_cancelled {
                continue;
            }
            invoke(&owner, kind_name, &callback, event);
        }
    }

    /// Drain in-flight dispatches and stop accepting new ones.
    pub async fn shutdown(&self) {
        self.permits.close();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("event bus shut down");
    }

    #[allow(clippy::type_complexity)]
    fn snapshot(&self, kind: TypeId) -> Vec<(String, &'static str, bool, EventCallback)> {
        self.handlers.read().get(&kind).map_or_else(Vec::new, |list| {
            list.iter()
                .map(|record| {
                    (
                        record.owner.clone(),
                        record.kind_name,
                        record.ignore_cancelled,
                        Arc::clone(&record.callback),
                    )
                })
                .collect()
        })
    }
}

fn invoke(owner: &str, kind_name: &str, callback: &EventCallback, event: &dyn ApplicationEvent) {
    match catch_unwind(AssertUnwindSafe(|| callback(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(owner, kind = kind_name, error = %e, "event handler failed"),
        Err(_) => warn!(owner, kind = kind_name, "event handler panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct PingEvent {
        base: EventBase,
        label: &'static str,
    }

    impl PingEvent {
        fn new(label: &'static str) -> Self {
            Self {
                base: EventBase::new(),
                label,
            }
        }
    }

    impl ApplicationEvent for PingEvent {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn cancelled(&self) -> bool {
            self.base.cancelled()
        }

        fn cancel(&self) {
            self.base.cancel();
        }
    }

    struct OtherEvent;

    impl ApplicationEvent for OtherEvent {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn recording_handler(
        log: &Arc<Mutex<Vec<String>>>,
        tag: &'static str,
    ) -> impl Fn(&PingEvent) -> Result<()> + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |event| {
            log.lock().push(format!("{tag}:{}", event.label));
            Ok(())
        }
    }

    #[test]
    fn priority_descending_then_registration_order() {
        let bus = EventBus::new(4);
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.register(
            "p",
            vec![
                HandlerRegistration::new(EventPriority::Low, false, recording_handler(&log, "low")),
                HandlerRegistration::new(
                    EventPriority::Highest,
                    false,
                    recording_handler(&log, "hi"),
                ),
                HandlerRegistration::new(
                    EventPriority::Normal,
                    false,
                    recording_handler(&log, "norm-a"),
                ),
                HandlerRegistration::new(
                    EventPriority::Normal,
                    false,
                    recording_handler(&log, "norm-b"),
                ),
            ],
        );

        bus.fire_sync(&PingEvent::new("e"));
        assert_eq!(
            *log.lock(),
            vec!["hi:e", "norm-a:e", "norm-b:e", "low:e"]
        );
    }

    #[test]
    fn cancelled_skips_ignore_cancelled_handlers() {
        let bus = EventBus::new(4);
        let log = Arc::new(Mutex::new(Vec::new()));

        // Highest-priority handler cancels the event.
        let cancelling: HandlerRegistration =
            HandlerRegistration::new(EventPriority::Highest, false, |event: &PingEvent| {
                event.cancel();
                Ok(())
            });
        bus.register(
            "p",
            vec![
                cancelling,
                HandlerRegistration::new(EventPriority::High, true, recording_handler(&log, "skip")),
                HandlerRegistration::new(EventPriority::Low, false, recording_handler(&log, "runs")),
            ],
        );

        bus.fire_sync(&PingEvent::new("e"));
        assert_eq!(*log.lock(), vec!["runs:e"]);
    }

    #[test]
    fn unregister_removes_all_owner_handlers() {
        let bus = EventBus::new(4);
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.register(
            "a",
            vec![HandlerRegistration::new(
                EventPriority::Normal,
                false,
                recording_handler(&log, "a"),
            )],
        );
        bus.register(
            "b",
            vec![HandlerRegistration::new(
                EventPriority::Normal,
                false,
                recording_handler(&log, "b"),
            )],
        );
        assert_eq!(bus.handler_count::<PingEvent>(), 2);

        bus.unregister("a");
        assert_eq!(bus.handler_count::<PingEvent>(), 1);

        bus.fire_sync(&PingEvent::new("e"));
        assert_eq!(*log.lock(), vec!["b:e"]);
    }

    #[test]
    fn handlers_only_see_their_event_type() {
        let bus = EventBus::new(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.register(
            "p",
            vec![HandlerRegistration::new(
                EventPriority::Normal,
                false,
                recording_handler(&log, "ping"),
            )],
        );

        bus.fire_sync(&OtherEvent);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn handler_error_does_not_stop_later_handlers() {
        let bus = EventBus::new(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.register(
            "p",
            vec![
                HandlerRegistration::new(EventPriority::High, false, |_: &PingEvent| {
                    Err(gantry_core::Error::state("boom"))
                }),
                HandlerRegistration::new(
                    EventPriority::Low,
                    false,
                    recording_handler(&log, "after"),
                ),
            ],
        );

        bus.fire_sync(&PingEvent::new("e"));
        assert_eq!(*log.lock(), vec!["after:e"]);
    }

    #[tokio::test]
    async fn async_fire_runs_all_handlers() {
        let bus = EventBus::new(2);
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.register(
            "p",
            vec![
                HandlerRegistration::new(EventPriority::High, false, recording_handler(&log, "1")),
                HandlerRegistration::new(EventPriority::Low, false, recording_handler(&log, "2")),
            ],
        );

        bus.fire(Arc::new(PingEvent::new("e"))).await;
        bus.shutdown().await;
        let mut seen = log.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["1:e", "2:e"]);
    }

    #[tokio::test]
    async fn fire_after_shutdown_is_dropped() {
        let bus = EventBus::new(2);
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.register(
            "p",
            vec![HandlerRegistration::new(
                EventPriority::Normal,
                false,
                recording_handler(&log, "x"),
            )],
        );

        bus.shutdown().await;
        bus.fire(Arc::new(PingEvent::new("e"))).await;
        assert!(log.lock().is_empty());
    }
}
