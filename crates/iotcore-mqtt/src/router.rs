//! Inbound topic routing.
//!
//! Maps each inbound publish to the handler whose pattern matches its topic
//! most specifically. Patterns are either exact topics or a literal prefix
//! ending in the multi-level wildcard `#`; the part of the topic after the
//! prefix is passed to the handler as the message name.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use rumqttc::QoS;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{MqttError, MqttResult};
use crate::message::InboundMessage;

/// Log level for inbound messages that cannot be dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnroutablePolicy {
    #[default]
    Debug,
    Warn,
}

/// Receives routed inbound messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// `name` is the topic remainder after the matched prefix (the full
    /// topic for exact patterns). `payload` is the parsed JSON body.
    async fn handle(&self, name: &str, payload: Value);
}

// ── Patterns ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    filter: String,
    /// Exact topic, or the prefix before `#` including its trailing `/`.
    literal: String,
    multi_level: bool,
}

impl TopicPattern {
    pub fn parse(filter: &str) -> MqttResult<Self> {
        if filter.is_empty() {
            return Err(MqttError::invalid_pattern(filter, "empty pattern"));
        }
        if filter.contains('+') {
            return Err(MqttError::invalid_pattern(
                filter,
                "single-level wildcard '+' is not supported",
            ));
        }

        let Some(hash) = filter.find('#') else {
            return Ok(Self {
                filter: filter.to_string(),
                literal: filter.to_string(),
                multi_level: false,
            });
        };

        let last = hash + 1 == filter.len();
        let own_level = hash == 0 || filter[..hash].ends_with('/');
        if !last || !own_level {
            return Err(MqttError::invalid_pattern(
                filter,
                "'#' must be the last level of the pattern",
            ));
        }

        Ok(Self {
            filter: filter.to_string(),
            literal: filter[..hash].to_string(),
            multi_level: true,
        })
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Match `topic` and return the message name it carries.
    pub fn strip<'t>(&self, topic: &'t str) -> Option<&'t str> {
        if !self.multi_level {
            return (topic == self.literal).then_some(topic);
        }
        // A root `#` never matches `$`-prefixed system topics.
        if self.literal.is_empty() {
            return (!topic.starts_with('$')).then_some(topic);
        }
        if let Some(rest) = topic.strip_prefix(self.literal.as_str()) {
            return Some(rest);
        }
        // `a/b/#` also matches the parent level `a/b`.
        (topic == &self.literal[..self.literal.len() - 1]).then_some("")
    }

    /// Sort key: longer literal prefix first, exact before wildcard on ties.
    fn specificity(&self) -> (Reverse<usize>, bool, String) {
        let depth = if self.multi_level {
            self.literal.len().saturating_sub(1)
        } else {
            self.literal.len()
        };
        (Reverse(depth), self.multi_level, self.filter.clone())
    }
}

/// Patterns ordered most-specific first.
#[derive(Debug)]
pub struct PatternSet<T> {
    entries: BTreeMap<(Reverse<usize>, bool, String), (TopicPattern, T)>,
}

impl<T> Default for PatternSet<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> PatternSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false, leaving the set unchanged, if the filter is already present.
    pub fn insert(&mut self, pattern: TopicPattern, value: T) -> bool {
        let key = pattern.specificity();
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, (pattern, value));
        true
    }

    pub fn find<'t>(&self, topic: &'t str) -> Option<(&TopicPattern, &T, &'t str)> {
        self.entries
            .values()
            .find_map(|(pattern, value)| pattern.strip(topic).map(|name| (pattern, value, name)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TopicPattern, &T)> {
        self.entries.values().map(|(pattern, value)| (pattern, value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Router ────────────────────────────────────────────────────

struct Route {
    qos: QoS,
    handler: Arc<dyn MessageHandler>,
}

/// Counters since the router was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub dispatched: u64,
    pub unroutable: u64,
    pub malformed: u64,
}

pub struct TopicRouter {
    routes: RwLock<PatternSet<Route>>,
    policy: UnroutablePolicy,
    dispatched: AtomicU64,
    unroutable: AtomicU64,
    malformed: AtomicU64,
}

impl TopicRouter {
    pub fn new(policy: UnroutablePolicy) -> Self {
        Self {
            routes: RwLock::new(PatternSet::new()),
            policy,
            dispatched: AtomicU64::new(0),
            unroutable: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    /// Register `handler` for `filter`. A filter can be registered once.
    pub fn register(
        &self,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> MqttResult<()> {
        let pattern = TopicPattern::parse(filter)?;
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        if !routes.insert(pattern, Route { qos, handler }) {
            return Err(MqttError::invalid_pattern(filter, "already subscribed"));
        }
        tracing::debug!(filter, ?qos, "route registered");
        Ok(())
    }

    /// Registered filters with their QoS, most specific first.
    pub fn filters(&self) -> Vec<(String, QoS)> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(pattern, route)| (pattern.filter().to_string(), route.qos))
            .collect()
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }

    /// Dispatch one message. Returns the name it was delivered under.
    pub async fn route(&self, message: InboundMessage) -> MqttResult<String> {
        let (name, handler) = {
            let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
            match routes.find(&message.topic) {
                Some((_, route, name)) => (name.to_string(), route.handler.clone()),
                None => {
                    self.unroutable.fetch_add(1, Ordering::Relaxed);
                    return Err(MqttError::Unroutable(message.topic.clone()));
                }
            }
        };

        let payload: Value = match serde_json::from_slice(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                return Err(MqttError::MalformedPayload {
                    topic: message.topic,
                    reason: e.to_string(),
                });
            }
        };

        handler.handle(&name, payload).await;
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(name)
    }

    /// Consume the inbound stream until every sender is gone.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundMessage>) {
        while let Some(message) = inbound.recv().await {
            tracing::debug!(topic = %message.topic, bytes = message.payload.len(), "inbound message");
            match self.route(message).await {
                Ok(name) => tracing::trace!(name, "dispatched"),
                Err(e) => self.report(&e),
            }
        }
        tracing::debug!("inbound stream closed, router stopping");
    }

    fn report(&self, error: &MqttError) {
        match self.policy {
            UnroutablePolicy::Debug => tracing::debug!(error = %error, "dropping inbound message"),
            UnroutablePolicy::Warn => tracing::warn!(error = %error, "dropping inbound message"),
        }
    }
}
