//! Publish/subscribe topic with attribute filter policies.
//!
//! A [`Topic`] fans a routed event out to every subscription whose
//! [`FilterPolicy`] matches the event attributes. Deliveries run concurrently
//! and are settled independently: one subscription failing never affects the
//! others.

use crate::consumer::{EventHandler, HandlerError};
use crate::event::{Attributes, RoutedEvent};
use crate::queue::WorkQueue;
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors reported by a subscription target
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Handler rejected event: {0}")]
    Rejected(String),

    #[error("Handler failed after {attempts} attempts: {message}")]
    Exhausted { attempts: u32, message: String },
}

/// Allow-list predicate on a single attribute.
///
/// Matches iff the attribute is present and its value is in the allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeFilter {
    pub attribute: String,
    pub allow: Vec<String>,
}

impl AttributeFilter {
    pub fn matches(&self, attributes: &Attributes) -> bool {
        attributes
            .get(&self.attribute)
            .map(|value| self.allow.iter().any(|allowed| allowed == value))
            .unwrap_or(false)
    }
}

/// Conjunction of attribute predicates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPolicy {
    filters: Vec<AttributeFilter>,
}

impl FilterPolicy {
    /// Policy with a single allow-list predicate
    pub fn allow<I, S>(attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::default().and_allow(attribute, values)
    }

    /// Add another predicate that must also match
    pub fn and_allow<I, S>(mut self, attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters.push(AttributeFilter {
            attribute: attribute.into(),
            allow: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn matches(&self, attributes: &Attributes) -> bool {
        self.filters.iter().all(|filter| filter.matches(attributes))
    }

    pub fn filters(&self) -> &[AttributeFilter] {
        &self.filters
    }
}

/// Destination of a subscription
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn deliver(&self, event: RoutedEvent) -> Result<(), DeliveryError>;
}

#[async_trait]
impl Subscriber for WorkQueue {
    async fn deliver(&self, event: RoutedEvent) -> Result<(), DeliveryError> {
        self.enqueue(event);
        Ok(())
    }
}

/// Retry schedule for direct handler subscriptions
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(5),
        }
    }
}

/// Subscription that invokes a handler directly, without a queue.
///
/// Transient failures are retried with exponential backoff up to
/// `max_attempts`; after that the event is logged and dropped.
pub struct HandlerSubscriber {
    handler: Arc<dyn EventHandler>,
    retry: RetryPolicy,
}

impl HandlerSubscriber {
    pub fn new(handler: Arc<dyn EventHandler>) -> Self {
        Self {
            handler,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl Subscriber for HandlerSubscriber {
    async fn deliver(&self, event: RoutedEvent) -> Result<(), DeliveryError> {
        let mut backoff = ExponentialBackoff {
            current_interval: self.retry.initial_interval,
            initial_interval: self.retry.initial_interval,
            max_interval: self.retry.max_interval,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;

            let error = match self.handler.handle(&event).await {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };

            self.handler.on_error(&event, &error).await;

            match error {
                HandlerError::Discarded(reason) => {
                    info!(event_id = %event.id, key = %event.object_key, reason = %reason, "Dropping event");
                    return Ok(());
                }
                HandlerError::Rejected(reason) => return Err(DeliveryError::Rejected(reason)),
                HandlerError::Transient(reason) => {
                    if attempts >= self.retry.max_attempts {
                        return Err(DeliveryError::Exhausted {
                            attempts,
                            message: reason,
                        });
                    }

                    let delay = backoff.next_backoff().unwrap_or(self.retry.max_interval);
                    debug!(
                        event_id = %event.id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying handler after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

struct Subscription {
    name: String,
    filter: Option<FilterPolicy>,
    target: Arc<dyn Subscriber>,
}

impl Subscription {
    fn accepts(&self, event: &RoutedEvent) -> bool {
        self.filter
            .as_ref()
            .map(|policy| policy.matches(&event.attributes))
            .unwrap_or(true)
    }
}

/// Result of one publish call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscriptions whose filter matched
    pub matched: Vec<String>,
    /// Subscriptions that accepted the event
    pub delivered: Vec<String>,
    /// Subscriptions that failed, with the reason
    pub failed: Vec<(String, String)>,
}

/// Fan-out topic
pub struct Topic {
    name: String,
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a subscription; `None` matches every event
    pub fn subscribe(&self, name: impl Into<String>, filter: Option<FilterPolicy>, target: Arc<dyn Subscriber>) {
        let name = name.into();
        info!(topic = %self.name, subscription = %name, filtered = filter.is_some(), "Adding subscription");

        self.subscriptions.write().push(Arc::new(Subscription { name, filter, target }));
    }

    pub fn subscription_names(&self) -> Vec<String> {
        self.subscriptions.read().iter().map(|s| s.name.clone()).collect()
    }

    /// Deliver the event to every matching subscription
    #[instrument(skip(self, event), fields(topic = %self.name, event_id = %event.id, kind = %event.kind))]
    pub async fn publish(&self, event: &RoutedEvent) -> PublishReport {
        let matching: Vec<Arc<Subscription>> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.accepts(event))
            .cloned()
            .collect();

        let deliveries = matching.iter().map(|subscription| {
            let event = event.clone();
            async move { (subscription.name.clone(), subscription.target.deliver(event).await) }
        });

        let mut report = PublishReport {
            matched: matching.iter().map(|s| s.name.clone()).collect(),
            ..Default::default()
        };

        for (name, result) in join_all(deliveries).await {
            match result {
                Ok(()) => report.delivered.push(name),
                Err(e) => {
                    warn!(subscription = %name, key = %event.object_key, error = %e, "Delivery failed");
                    metrics::counter!("pipeline.topic.delivery_failed", "subscription" => name.clone())
                        .increment(1);
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        debug!(
            matched = report.matched.len(),
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Event published"
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{COMMENT_TYPE_ATTRIBUTE, EVENT_KIND_ATTRIBUTE};
    use parking_lot::Mutex;

    struct CountingHandler {
        seen: Mutex<Vec<String>>,
        result: Result<(), HandlerError>,
    }

    impl CountingHandler {
        fn new(result: Result<(), HandlerError>) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                result,
            })
        }

        fn count(&self) -> usize {
            self.seen.lock().len()
        }
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, event: &RoutedEvent) -> Result<(), HandlerError> {
            self.seen.lock().push(event.object_key.clone());
            self.result.clone()
        }
    }

    fn caption_update(comment_type: Option<&str>) -> RoutedEvent {
        let event = RoutedEvent::description_updated("images", "a.png", "Sunset")
            .with_attribute(EVENT_KIND_ATTRIBUTE, "DescriptionUpdated");
        match comment_type {
            Some(value) => event.with_attribute(COMMENT_TYPE_ATTRIBUTE, value),
            None => event,
        }
    }

    #[test]
    fn test_filter_policy_matching() {
        let policy = FilterPolicy::allow(COMMENT_TYPE_ATTRIBUTE, ["Caption"]);

        assert!(policy.matches(&caption_update(Some("Caption")).attributes));
        assert!(!policy.matches(&caption_update(Some("Other")).attributes));
        assert!(!policy.matches(&caption_update(None).attributes));
    }

    #[test]
    fn test_filter_policy_requires_every_predicate() {
        let policy = FilterPolicy::allow(EVENT_KIND_ATTRIBUTE, ["DescriptionUpdated"])
            .and_allow(COMMENT_TYPE_ATTRIBUTE, ["Caption", "Title"]);

        assert!(policy.matches(&caption_update(Some("Title")).attributes));

        let created = RoutedEvent::created("images", "a.png")
            .with_attribute(EVENT_KIND_ATTRIBUTE, "Created")
            .with_attribute(COMMENT_TYPE_ATTRIBUTE, "Caption");
        assert!(!policy.matches(&created.attributes));
    }

    #[tokio::test]
    async fn test_publish_respects_filters() {
        let topic = Topic::new("changes");
        let all = CountingHandler::new(Ok(()));
        let captions = CountingHandler::new(Ok(()));

        topic.subscribe("all", None, Arc::new(HandlerSubscriber::new(all.clone())));
        topic.subscribe(
            "captions",
            Some(FilterPolicy::allow(COMMENT_TYPE_ATTRIBUTE, ["Caption"])),
            Arc::new(HandlerSubscriber::new(captions.clone())),
        );

        let report = topic.publish(&caption_update(Some("Other"))).await;
        assert_eq!(report.matched, vec!["all".to_string()]);

        let report = topic.publish(&caption_update(Some("Caption"))).await;
        assert_eq!(report.delivered.len(), 2);

        assert_eq!(all.count(), 2);
        assert_eq!(captions.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_subscription_does_not_affect_others() {
        let topic = Topic::new("uploads");
        let broken = CountingHandler::new(Err(HandlerError::transient("down")));
        let queue = Arc::new(WorkQueue::new("image-process", Duration::from_secs(30)));

        topic.subscribe(
            "broken",
            None,
            Arc::new(HandlerSubscriber::new(broken.clone()).with_retry(RetryPolicy {
                max_attempts: 3,
                initial_interval: Duration::from_millis(10),
                max_interval: Duration::from_millis(50),
            })),
        );
        topic.subscribe("queue", None, queue.clone());

        let report = topic.publish(&RoutedEvent::created("images", "a.png")).await;

        assert_eq!(report.delivered, vec!["queue".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(broken.count(), 3);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_discarded_event_counts_as_delivered() {
        let topic = Topic::new("changes");
        let handler = CountingHandler::new(Err(HandlerError::discarded("unknown key")));
        topic.subscribe("update", None, Arc::new(HandlerSubscriber::new(handler.clone())));

        let report = topic.publish(&caption_update(Some("Caption"))).await;
        assert_eq!(report.delivered, vec!["update".to_string()]);
        assert_eq!(handler.count(), 1);
    }
}
