//! Filtered publish/subscribe dispatcher.
//!
//! `publish` copies the subscriber list under the lock and fans out with
//! the lock released, so handlers may subscribe, unsubscribe or publish
//! without deadlocking. Dispatch runs on the publisher's thread, which
//! keeps each publisher's events in order for every subscriber.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::bus::event::{DataChangeEvent, EventFilter};
use crate::logging::panic_message;

/// Error a subscriber handler may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A consumer of bus events.
pub trait DataChangeSubscriber: Send + Sync + 'static {
    /// Used in logs when the handler fails.
    fn name(&self) -> &str;

    fn filter(&self) -> &EventFilter;

    fn on_event(&self, event: &DataChangeEvent) -> Result<(), HandlerError>;
}

/// Closure-backed subscriber.
pub struct FnSubscriber<F> {
    name: String,
    filter: EventFilter,
    handler: F,
}

impl<F> FnSubscriber<F>
where
    F: Fn(&DataChangeEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, filter: EventFilter, handler: F) -> Self {
        Self {
            name: name.into(),
            filter,
            handler,
        }
    }
}

impl<F> DataChangeSubscriber for FnSubscriber<F>
where
    F: Fn(&DataChangeEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn filter(&self) -> &EventFilter {
        &self.filter
    }

    fn on_event(&self, event: &DataChangeEvent) -> Result<(), HandlerError> {
        (self.handler)(event)
    }
}

/// Registration handle, unique per `subscribe` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("subscriber '{subscriber}' failed: {cause}")]
    DispatchFailure { subscriber: String, cause: String },
}

/// Outcome of one `publish` call.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Subscribers whose filter matched and whose handler was invoked.
    pub delivered: usize,
    pub failures: Vec<BusError>,
}

#[derive(Clone)]
struct Registration {
    id: SubscriptionId,
    subscriber: Arc<dyn DataChangeSubscriber>,
}

#[derive(Default)]
pub struct DataChangeBus {
    subscribers: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl DataChangeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Registering the same instance twice returns
    /// the existing id instead of adding a duplicate.
    pub fn subscribe(&self, subscriber: Arc<dyn DataChangeSubscriber>) -> SubscriptionId {
        let mut subscribers = self.subscribers.lock();
        if let Some(existing) = subscribers
            .iter()
            .find(|r| Arc::ptr_eq(&r.subscriber, &subscriber))
        {
            return existing.id;
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!("Bus subscriber '{}' registered", subscriber.name());
        subscribers.push(Registration { id, subscriber });
        id
    }

    /// Register a closure as a subscriber.
    pub fn subscribe_fn<F>(
        &self,
        name: impl Into<String>,
        filter: EventFilter,
        handler: F,
    ) -> SubscriptionId
    where
        F: Fn(&DataChangeEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnSubscriber::new(name, filter, handler)))
    }

    /// Remove a subscriber. Returns `false` if the id was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|r| r.id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver `event` to every matching subscriber registered at the
    /// time of the call, in registration order. A failing or panicking
    /// handler is logged and skipped.
    pub fn publish(&self, event: &DataChangeEvent) -> DispatchReport {
        let snapshot: Vec<Registration> = self.subscribers.lock().clone();

        let mut report = DispatchReport::default();
        for registration in snapshot
            .iter()
            .filter(|r| r.subscriber.filter().matches(event))
        {
            report.delivered += 1;
            let subscriber = &registration.subscriber;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| subscriber.on_event(event)));
            let cause = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };
            let error = BusError::DispatchFailure {
                subscriber: subscriber.name().to_string(),
                cause,
            };
            tracing::warn!("Dropping '{}' event: {error}", event.property_name());
            report.failures.push(error);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::event::{DestType, SourceType};
    use serde_json::{json, Value};
    use std::sync::mpsc;
    use std::thread;

    fn event(source: SourceType, dest: DestType) -> DataChangeEvent {
        DataChangeEvent::json(source, dest, "prop", Value::Null)
    }

    /// Records the property names it receives.
    fn recorder(bus: &DataChangeBus, name: &str, filter: EventFilter) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe_fn(name, filter, move |e| {
            sink.lock().push(e.property_name().to_string());
            Ok(())
        });
        seen
    }

    #[test]
    fn delivery_follows_filter_for_every_combination() {
        let bus = DataChangeBus::new();
        let wanted_sources = [SourceType::Websocket, SourceType::Http];
        let wanted_dests = [DestType::ActivePipelineSettings];
        let count = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&count);
        bus.subscribe_fn(
            "filtered",
            EventFilter::new(wanted_sources, wanted_dests),
            move |_| {
                *counter.lock() += 1;
                Ok(())
            },
        );

        for source in SourceType::ALL {
            for dest in DestType::ALL {
                let before = *count.lock();
                bus.publish(&event(source, dest));
                let received = *count.lock() > before;
                let expected = wanted_sources.contains(&source) && wanted_dests.contains(&dest);
                assert_eq!(received, expected, "{source:?} -> {dest:?}");
            }
        }
    }

    #[test]
    fn all_filter_receives_every_event() {
        let bus = DataChangeBus::new();
        let seen = recorder(&bus, "everything", EventFilter::all());
        for source in SourceType::ALL {
            for dest in DestType::ALL {
                bus.publish(&event(source, dest));
            }
        }
        assert_eq!(seen.lock().len(), 25);
    }

    #[test]
    fn failing_subscriber_does_not_block_later_ones() {
        let bus = DataChangeBus::new();
        bus.subscribe_fn("broken", EventFilter::all(), |_| Err("disk full".into()));
        bus.subscribe_fn("panicky", EventFilter::all(), |_| panic!("handler bug"));
        let seen = recorder(&bus, "healthy", EventFilter::all());

        let report = bus.publish(&event(SourceType::Http, DestType::GeneralSettings));

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(report.delivered, 3);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(
            report.failures[0],
            BusError::DispatchFailure {
                subscriber: "broken".to_string(),
                cause: "disk full".to_string()
            }
        );
        assert_eq!(
            report.failures[1].to_string(),
            "subscriber 'panicky' failed: panicked: handler bug"
        );
    }

    #[test]
    fn unsubscribed_handler_receives_nothing_more() {
        let bus = DataChangeBus::new();
        let seen = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&seen);
        let id = bus.subscribe_fn("temp", EventFilter::all(), move |_| {
            *counter.lock() += 1;
            Ok(())
        });

        bus.publish(&event(SourceType::Other, DestType::Other));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(&event(SourceType::Other, DestType::Other));

        assert_eq!(*seen.lock(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn same_instance_subscribes_once() {
        let bus = DataChangeBus::new();
        let subscriber: Arc<dyn DataChangeSubscriber> =
            Arc::new(FnSubscriber::new("once", EventFilter::all(), |_| Ok(())));
        let a = bus.subscribe(Arc::clone(&subscriber));
        let b = bus.subscribe(subscriber);
        assert_eq!(a, b);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn handler_may_unsubscribe_itself_during_dispatch() {
        let bus = Arc::new(DataChangeBus::new());
        let id_slot = Arc::new(Mutex::new(None::<SubscriptionId>));

        let bus_in_handler = Arc::clone(&bus);
        let slot = Arc::clone(&id_slot);
        let id = bus.subscribe_fn("one-shot", EventFilter::all(), move |_| {
            if let Some(id) = *slot.lock() {
                bus_in_handler.unsubscribe(id);
            }
            Ok(())
        });
        *id_slot.lock() = Some(id);
        let later = recorder(&bus, "later", EventFilter::all());

        let report = bus.publish(&event(SourceType::Other, DestType::Other));
        assert_eq!(report.delivered, 2);
        assert_eq!(later.lock().len(), 1);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn handler_subscribing_during_dispatch_misses_current_event() {
        let bus = Arc::new(DataChangeBus::new());
        let late = Arc::new(Mutex::new(0usize));

        let bus_in_handler = Arc::clone(&bus);
        let late_counter = Arc::clone(&late);
        bus.subscribe_fn("spawner", EventFilter::all(), move |_| {
            let counter = Arc::clone(&late_counter);
            bus_in_handler.subscribe_fn("late", EventFilter::all(), move |_| {
                *counter.lock() += 1;
                Ok(())
            });
            Ok(())
        });

        bus.publish(&event(SourceType::Other, DestType::Other));
        assert_eq!(*late.lock(), 0);
    }

    #[test]
    fn per_publisher_order_is_preserved() {
        let bus = Arc::new(DataChangeBus::new());
        let (tx, rx) = mpsc::channel::<(String, i64)>();
        let tx = Mutex::new(tx);
        bus.subscribe_fn("ordered", EventFilter::all(), move |e| {
            let n = e.value().as_json().and_then(Value::as_i64).unwrap_or(-1);
            tx.lock().send((e.property_name().to_string(), n))?;
            Ok(())
        });

        let publishers: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                let bus = Arc::clone(&bus);
                thread::spawn(move || {
                    for n in 0..200 {
                        bus.publish(&DataChangeEvent::json(
                            SourceType::Other,
                            DestType::Other,
                            name,
                            json!(n),
                        ));
                    }
                })
            })
            .collect();
        for handle in publishers {
            handle.join().unwrap();
        }

        let mut last = std::collections::HashMap::new();
        for (name, n) in rx.try_iter() {
            let previous = last.insert(name.clone(), n).unwrap_or(-1);
            assert!(n > previous, "{name}: {n} after {previous}");
        }
        assert_eq!(last.len(), 3);
        assert!(last.values().all(|&n| n == 199));
    }

    #[test]
    fn concurrent_subscribe_and_publish_is_safe() {
        let bus = Arc::new(DataChangeBus::new());
        let churn = {
            let bus = Arc::clone(&bus);
            thread::spawn(move || {
                for i in 0..200 {
                    let id = bus.subscribe_fn(format!("churn-{i}"), EventFilter::all(), |_| Ok(()));
                    bus.unsubscribe(id);
                }
            })
        };
        for _ in 0..200 {
            bus.publish(&event(SourceType::Other, DestType::Other));
        }
        churn.join().unwrap();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn bus_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DataChangeBus>();
    }
}
