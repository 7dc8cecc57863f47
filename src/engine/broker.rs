// Event broker
// In-process publish/subscribe with named and pattern subscriptions

//! # Event Broker
//!
//! The broker connects ports to each other and lets operators observe the
//! runtime's lifecycle events. It is an explicit object (no global), so every
//! worker thread can own one and tests can build as many as they like.
//!
//! ## Delivery
//!
//! [`EventBroker::publish`] runs every matching handler concurrently and waits
//! for all of them. Exact-name subscriptions are matched first, then pattern
//! subscriptions (skipped when the publisher sets `regex_off` and an exact
//! subscription matched). Handlers that fail or panic are logged and do not
//! affect other handlers or the publisher.
//!
//! ## Options
//!
//! - `once`: removed on first delivery; concurrent publishes deliver it once
//! - `delay`: handler runs on a spawned task after the delay
//! - `filter`, `ignore`, `predicate`, origin lists: all must accept the event
//! - `privileged`: the event must carry the SHA-256 hex digest of the secret
//! - `singleton`: registration is dropped if the key already has a handler

use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::models::{Event, EventKey, PublishOptions, SubscribeOptions, SubscriptionId};

/// Something that can receive events.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: Event) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(&self, event: Event) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin((self)(event))
    }
}

/// Returned by a successful subscribe; pass it back to unsubscribe.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub key: String,
    pub pattern: bool,
}

struct Registration {
    id: SubscriptionId,
    key: String,
    handler: Arc<dyn EventHandler>,
    options: SubscribeOptions,
    privilege_token: Option<String>,
}

impl Registration {
    fn accepts(&self, event: &Event) -> bool {
        if let Some(expected) = &self.privilege_token {
            if event.privileged_token.as_deref() != Some(expected.as_str()) {
                return false;
            }
        }
        self.options.accepts_content(event)
    }
}

struct PatternTopic {
    regex: regex::Regex,
    registrations: Vec<Arc<Registration>>,
}

/// Publish/subscribe hub.
#[derive(Default)]
pub struct EventBroker {
    exact: DashMap<String, Vec<Arc<Registration>>>,
    patterns: DashMap<String, PatternTopic>,
    published: AtomicU64,
}

impl EventBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The digest a publisher attaches to reach subscribers holding `secret`.
    pub fn privilege_token(secret: &str) -> String {
        format!("{:x}", Sha256::digest(secret.as_bytes()))
    }

    /// Register `handler` for `key`.
    ///
    /// Returns `None` when the key is empty or when a singleton rule rejects
    /// the registration.
    pub fn subscribe(
        &self,
        key: impl Into<EventKey>,
        handler: impl EventHandler,
        options: SubscribeOptions,
    ) -> Option<Subscription> {
        let key = key.into();
        if key.as_str().is_empty() {
            warn!("Ignoring subscription with an empty event name");
            return None;
        }

        let registration = Arc::new(Registration {
            id: SubscriptionId::new(),
            key: key.as_str().to_string(),
            handler: Arc::new(handler),
            privilege_token: options.privileged.as_deref().map(Self::privilege_token),
            options,
        });

        let accepted = match &key {
            EventKey::Name(name) => {
                let mut entry = self.exact.entry(name.clone()).or_default();
                Self::admit(entry.value_mut(), Arc::clone(&registration))
            }
            EventKey::Pattern(regex) => {
                let mut entry = self
                    .patterns
                    .entry(regex.as_str().to_string())
                    .or_insert_with(|| PatternTopic {
                        regex: regex.clone(),
                        registrations: Vec::new(),
                    });
                Self::admit(&mut entry.value_mut().registrations, Arc::clone(&registration))
            }
        };

        if !accepted {
            debug!(event = %key, "Singleton subscription already present, registration dropped");
            return None;
        }

        debug!(event = %key, subscription = %registration.id, "Subscribed");
        Some(Subscription {
            id: registration.id,
            key: registration.key.clone(),
            pattern: key.is_pattern(),
        })
    }

    fn admit(registrations: &mut Vec<Arc<Registration>>, registration: Arc<Registration>) -> bool {
        let blocked = if registration.options.singleton {
            !registrations.is_empty()
        } else {
            registrations.iter().any(|r| r.options.singleton)
        };
        if blocked {
            return false;
        }
        registrations.push(registration);
        true
    }

    /// Remove the registration `id` filed under `key`. Returns whether it existed.
    pub fn unsubscribe(&self, key: &str, id: SubscriptionId) -> bool {
        // A name and a pattern may share the same key string.
        if Self::remove_from(&self.exact, key, id, |regs| regs) == Some(true) {
            self.exact.remove_if(key, |_, regs| regs.is_empty());
            return true;
        }
        if Self::remove_from(&self.patterns, key, id, |topic| &mut topic.registrations) == Some(true) {
            self.patterns.remove_if(key, |_, topic| topic.registrations.is_empty());
            return true;
        }
        false
    }

    fn remove_from<T>(
        map: &DashMap<String, T>,
        key: &str,
        id: SubscriptionId,
        registrations: impl FnOnce(&mut T) -> &mut Vec<Arc<Registration>>,
    ) -> Option<bool> {
        let mut entry = map.get_mut(key)?;
        let regs = registrations(entry.value_mut());
        let before = regs.len();
        regs.retain(|r| r.id != id);
        Some(regs.len() != before)
    }

    /// Convenience for `unsubscribe(&subscription.key, subscription.id)`.
    pub fn cancel(&self, subscription: &Subscription) -> bool {
        self.unsubscribe(&subscription.key, subscription.id)
    }

    /// Deliver an event to every matching subscription and wait for the handlers.
    ///
    /// Returns how many handlers were started.
    pub async fn publish(&self, name: &str, payload: Value, options: PublishOptions) -> usize {
        let event = Event::new(name, payload, &options);
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut matched: Vec<Arc<Registration>> = self
            .exact
            .get(name)
            .map(|regs| regs.value().clone())
            .unwrap_or_default();

        if !(options.regex_off && !matched.is_empty()) {
            for topic in self.patterns.iter() {
                if topic.regex.is_match(name) {
                    matched.extend(topic.registrations.iter().cloned());
                }
            }
        }

        if matched.is_empty() {
            debug!(event = name, "No subscribers");
            return 0;
        }

        let deliveries = matched
            .into_iter()
            .map(|registration| self.deliver(registration, event.clone()));
        join_all(deliveries).await.into_iter().filter(|ran| *ran).count()
    }

    async fn deliver(&self, registration: Arc<Registration>, event: Event) -> bool {
        if !registration.accepts(&event) {
            return false;
        }

        // Whoever removes a `once` registration owns its single delivery.
        if registration.options.once && !self.unsubscribe(&registration.key, registration.id) {
            return false;
        }

        let delay = registration.options.delay;
        if !delay.is_zero() {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                run_handler(registration, event).await;
            });
            return true;
        }

        run_handler(registration, event).await;
        true
    }

    /// Number of registrations filed under exactly `key`.
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.exact
            .get(key)
            .map(|regs| regs.len())
            .or_else(|| self.patterns.get(key).map(|topic| topic.registrations.len()))
            .unwrap_or(0)
    }

    /// Every key with at least one registration; patterns are shown as `/re/`.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.exact.iter().map(|e| e.key().clone()).collect();
        topics.extend(self.patterns.iter().map(|e| format!("/{}/", e.key())));
        topics.sort();
        topics
    }

    pub fn events_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

async fn run_handler(registration: Arc<Registration>, event: Event) {
    let name = event.name.clone();
    let started = std::panic::catch_unwind(AssertUnwindSafe(|| registration.handler.handle(event)));
    let future = match started {
        Ok(future) => future,
        Err(_) => {
            error!(event = %name, subscription = %registration.id, "Event handler panicked");
            return;
        }
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(event = %name, subscription = %registration.id, error = %e, "Event handler failed")
        }
        Err(_) => error!(event = %name, subscription = %registration.id, "Event handler panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn counting(count: &Arc<AtomicUsize>) -> impl EventHandler {
        let count = Arc::clone(count);
        move |_event: Event| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        }
    }

    #[tokio::test]
    async fn exact_and_pattern_subscribers_both_receive() {
        let broker = EventBroker::new();
        let exact = counter();
        let pattern = counter();
        broker.subscribe("orderCreated", counting(&exact), SubscribeOptions::default());
        broker.subscribe(
            Regex::new("^order").unwrap(),
            counting(&pattern),
            SubscribeOptions::default(),
        );

        assert_eq!(broker.publish("orderCreated", json!({}), PublishOptions::default()).await, 2);
        assert_eq!(broker.publish("orderShipped", json!({}), PublishOptions::default()).await, 1);
        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(pattern.load(Ordering::SeqCst), 2);

        // regex_off skips patterns only when an exact subscriber matched
        broker
            .publish("orderCreated", json!({}), PublishOptions::default().regex_off())
            .await;
        assert_eq!(pattern.load(Ordering::SeqCst), 2);
        broker
            .publish("orderPaid", json!({}), PublishOptions::default().regex_off())
            .await;
        assert_eq!(pattern.load(Ordering::SeqCst), 3);
        assert_eq!(broker.events_published(), 4);
    }

    #[tokio::test]
    async fn once_delivers_a_single_time_under_concurrency() {
        let broker = Arc::new(EventBroker::new());
        let count = counter();
        broker.subscribe("tick", counting(&count), SubscribeOptions::default().once());

        let publishes = (0..8).map(|_| {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.publish("tick", Value::Null, PublishOptions::default()).await })
        });
        for handle in join_all(publishes).await {
            handle.unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(broker.subscriber_count("tick"), 0);
        assert!(broker.topics().is_empty());
    }

    #[tokio::test]
    async fn singleton_keeps_the_first_handler() {
        let broker = EventBroker::new();
        let first = counter();
        let second = counter();

        assert!(broker
            .subscribe("reserved", counting(&first), SubscribeOptions::default().singleton())
            .is_some());
        assert!(broker
            .subscribe("reserved", counting(&second), SubscribeOptions::default().singleton())
            .is_none());
        assert!(broker
            .subscribe("reserved", counting(&second), SubscribeOptions::default())
            .is_none());

        broker.publish("reserved", Value::Null, PublishOptions::default()).await;
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_handlers_do_not_stop_the_others() {
        let broker = EventBroker::new();
        let count = counter();
        broker.subscribe(
            "boom",
            |_event: Event| async move { Err::<(), _>(anyhow::anyhow!("handler failed")) },
            SubscribeOptions::default(),
        );
        broker.subscribe(
            "boom",
            |event: Event| async move {
                if event.name == "boom" {
                    panic!("handler panicked");
                }
                anyhow::Ok(())
            },
            SubscribeOptions::default(),
        );
        broker.subscribe("boom", counting(&count), SubscribeOptions::default());

        assert_eq!(broker.publish("boom", Value::Null, PublishOptions::default()).await, 3);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn privileged_subscribers_need_the_digest() {
        let broker = EventBroker::new();
        let count = counter();
        broker.subscribe(
            "secrets",
            counting(&count),
            SubscribeOptions::default().privileged("s3cret"),
        );

        broker.publish("secrets", Value::Null, PublishOptions::default()).await;
        broker
            .publish("secrets", Value::Null, PublishOptions::default().privileged("wrong"))
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let token = EventBroker::privilege_token("s3cret");
        assert_eq!(token.len(), 64);
        broker
            .publish("secrets", Value::Null, PublishOptions::default().privileged(token))
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn filters_apply_before_delivery() {
        let broker = EventBroker::new();
        let count = counter();
        broker.subscribe(
            "paid",
            counting(&count),
            SubscribeOptions::default().filter("region", json!("eu")),
        );

        broker.publish("paid", json!({"region": "us"}), PublishOptions::default()).await;
        broker.publish("paid", json!({"region": "eu"}), PublishOptions::default()).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_handlers_run_later() {
        let broker = EventBroker::new();
        let count = counter();
        broker.subscribe(
            "later",
            counting(&count),
            SubscribeOptions::default().delay(Duration::from_millis(100)),
        );

        assert_eq!(broker.publish("later", Value::Null, PublishOptions::default()).await, 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_reports_whether_anything_was_removed() {
        let broker = EventBroker::new();
        let count = counter();
        let sub = broker
            .subscribe("x", counting(&count), SubscribeOptions::default())
            .unwrap();
        assert!(broker.subscribe("", counting(&count), SubscribeOptions::default()).is_none());

        assert!(broker.cancel(&sub));
        assert!(!broker.cancel(&sub));
        assert_eq!(broker.publish("x", Value::Null, PublishOptions::default()).await, 0);

        let pattern = broker
            .subscribe(Regex::new("^x").unwrap(), counting(&count), SubscribeOptions::default())
            .unwrap();
        assert!(pattern.pattern);
        assert_eq!(broker.topics(), vec!["/^x/".to_string()]);
        assert!(broker.unsubscribe("^x", pattern.id));
        assert!(broker.topics().is_empty());
    }

    #[tokio::test]
    async fn patterns_sharing_a_name_key_can_be_unsubscribed() {
        let broker = EventBroker::new();
        let count = counter();
        let named = broker
            .subscribe("^x", counting(&count), SubscribeOptions::default())
            .unwrap();
        let pattern = broker
            .subscribe(Regex::new("^x").unwrap(), counting(&count), SubscribeOptions::default())
            .unwrap();
        assert_eq!(broker.topics(), vec!["/^x/".to_string(), "^x".to_string()]);

        assert!(broker.cancel(&pattern));
        assert_eq!(broker.topics(), vec!["^x".to_string()]);
        assert_eq!(broker.subscriber_count("^x"), 1);

        broker.publish("xray", Value::Null, PublishOptions::default()).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        assert!(broker.cancel(&named));
        assert!(broker.topics().is_empty());
    }
}
