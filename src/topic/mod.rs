//! Topic validation and the subscription index
//!
//! Subscriptions are bucketed by [`TopicHash`]. Filters without wildcards
//! live in one map keyed by hash; wildcard filters are grouped by mask, then
//! by hash. Matching a topic costs one exact lookup plus one lookup per
//! distinct mask, and every candidate is re-checked literally so hash
//! collisions never produce a false match.

mod hash;
pub mod validation;


pub use hash::{TopicHash, HASH_LEVELS};
pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::{QoS, SubscriptionOptions};

/// One client's subscription to one filter.
///
/// The owning session keeps its own copy; the index only uses the client id
/// to point back at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub client_id: Arc<str>,
    pub filter: Arc<str>,
    pub options: SubscriptionOptions,
    /// v5 subscription identifier
    pub subscription_id: Option<u32>,
    pub topic_hash: TopicHash,
}

impl Subscription {
    pub fn new(
        client_id: impl Into<Arc<str>>,
        filter: impl Into<Arc<str>>,
        options: SubscriptionOptions,
        subscription_id: Option<u32>,
    ) -> Self {
        let filter = filter.into();
        Self {
            client_id: client_id.into(),
            topic_hash: TopicHash::calculate(&filter),
            filter,
            options,
            subscription_id,
        }
    }

    pub fn qos(&self) -> QoS {
        self.options.qos
    }

    /// Full match test: hash pre-filter, then the literal comparison
    pub fn matches(&self, topic: &str, topic_hash: u64) -> bool {
        if !self.topic_hash.may_match(topic_hash) {
            return false;
        }
        if self.topic_hash.has_wildcard {
            topic_matches_filter(topic, &self.filter)
        } else {
            *self.filter == *topic
        }
    }
}

/// One subscriber's share of a published message after de-duplication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub client_id: Arc<str>,
    /// Highest `min(publish QoS, subscription QoS)` across the client's
    /// matching subscriptions
    pub qos: QoS,
    /// Any matching subscription asked for the retain flag to be kept
    pub retain_as_published: bool,
    pub subscription_ids: SmallVec<[u32; 2]>,
}

type Bucket = SmallVec<[Arc<Subscription>; 4]>;

#[derive(Default)]
struct IndexInner {
    exact: AHashMap<u64, Bucket>,
    /// mask -> hash -> subscriptions
    wildcard: AHashMap<u64, AHashMap<u64, Bucket>>,
    by_client: AHashMap<Arc<str>, AHashMap<Arc<str>, Arc<Subscription>>>,
}

impl IndexInner {
    fn bucket_mut(&mut self, topic_hash: &TopicHash) -> &mut Bucket {
        if topic_hash.has_wildcard {
            self.wildcard
                .entry(topic_hash.mask)
                .or_default()
                .entry(topic_hash.hash)
                .or_default()
        } else {
            self.exact.entry(topic_hash.hash).or_default()
        }
    }

    fn remove_entry(&mut self, sub: &Subscription) {
        let th = sub.topic_hash;
        let same = |s: &Arc<Subscription>| s.client_id == sub.client_id && s.filter == sub.filter;
        if th.has_wildcard {
            if let Some(group) = self.wildcard.get_mut(&th.mask) {
                if let Some(bucket) = group.get_mut(&th.hash) {
                    bucket.retain(|s| !same(s));
                    if bucket.is_empty() {
                        group.remove(&th.hash);
                    }
                }
                if group.is_empty() {
                    self.wildcard.remove(&th.mask);
                }
            }
        } else if let Some(bucket) = self.exact.get_mut(&th.hash) {
            bucket.retain(|s| !same(s));
            if bucket.is_empty() {
                self.exact.remove(&th.hash);
            }
        }
    }
}

/// Thread-safe subscription index.
///
/// Writers take the lock exclusively, so a concurrent match always sees a
/// complete subscription set.
#[derive(Default)]
pub struct SubscriptionIndex {
    inner: RwLock<IndexInner>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a subscription. Returns `true` if the client already
    /// had a subscription with the same filter.
    pub fn subscribe(&self, subscription: Subscription) -> bool {
        let subscription = Arc::new(subscription);
        let mut inner = self.inner.write();
        let previous = inner
            .by_client
            .entry(subscription.client_id.clone())
            .or_default()
            .insert(subscription.filter.clone(), subscription.clone());
        if let Some(ref old) = previous {
            inner.remove_entry(old);
        }
        inner.bucket_mut(&subscription.topic_hash).push(subscription);
        previous.is_some()
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn unsubscribe(&self, client_id: &str, filter: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(filters) = inner.by_client.get_mut(client_id) else {
            return false;
        };
        let Some(removed) = filters.remove(filter) else {
            return false;
        };
        if filters.is_empty() {
            inner.by_client.remove(client_id);
        }
        inner.remove_entry(&removed);
        true
    }

    /// Remove every subscription a client holds
    pub fn unsubscribe_all(&self, client_id: &str) -> usize {
        let mut inner = self.inner.write();
        let Some(filters) = inner.by_client.remove(client_id) else {
            return 0;
        };
        for sub in filters.values() {
            inner.remove_entry(sub);
        }
        filters.len()
    }

    /// Every subscription whose filter matches `topic`, one entry per
    /// (client, filter) pair
    pub fn matching(&self, topic: &str) -> Vec<Arc<Subscription>> {
        let topic_hash = TopicHash::calculate(topic).hash;
        let mut out = Vec::new();
        self.for_each_match(topic, topic_hash, |sub| out.push(sub.clone()));
        out
    }

    /// Resolve a publish into per-client routes.
    ///
    /// Overlapping subscriptions of one client collapse into one route at
    /// the highest effective QoS. `no_local` subscriptions are skipped for
    /// the publishing client. Routes keep the order in which each client was
    /// first matched.
    pub fn resolve(&self, topic: &str, publish_qos: QoS, sender: Option<&str>) -> Vec<Route> {
        let topic_hash = TopicHash::calculate(topic).hash;
        let mut routes: Vec<Route> = Vec::new();
        let mut positions: AHashMap<Arc<str>, usize> = AHashMap::new();

        self.for_each_match(topic, topic_hash, |sub| {
            if sub.options.no_local && sender == Some(&*sub.client_id) {
                return;
            }
            let qos = publish_qos.min(sub.qos());
            match positions.get(&sub.client_id) {
                Some(&i) => {
                    let route = &mut routes[i];
                    route.qos = route.qos.max(qos);
                    route.retain_as_published |= sub.options.retain_as_published;
                    if let Some(id) = sub.subscription_id {
                        route.subscription_ids.push(id);
                    }
                }
                None => {
                    positions.insert(sub.client_id.clone(), routes.len());
                    routes.push(Route {
                        client_id: sub.client_id.clone(),
                        qos,
                        retain_as_published: sub.options.retain_as_published,
                        subscription_ids: sub.subscription_id.into_iter().collect(),
                    });
                }
            }
        });
        routes
    }

    fn for_each_match<F>(&self, topic: &str, topic_hash: u64, mut f: F)
    where
        F: FnMut(&Arc<Subscription>),
    {
        let inner = self.inner.read();
        if let Some(bucket) = inner.exact.get(&topic_hash) {
            bucket
                .iter()
                .filter(|s| *s.filter == *topic)
                .for_each(&mut f);
        }
        for (mask, group) in &inner.wildcard {
            if let Some(bucket) = group.get(&(topic_hash & mask)) {
                bucket
                    .iter()
                    .filter(|s| topic_matches_filter(topic, &s.filter))
                    .for_each(&mut f);
            }
        }
    }

    /// A client's current subscriptions
    pub fn client_subscriptions(&self, client_id: &str) -> Vec<Arc<Subscription>> {
        self.inner
            .read()
            .by_client
            .get(client_id)
            .map(|filters| filters.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Total subscriptions across all clients
    pub fn len(&self) -> usize {
        self.inner.read().by_client.values().map(|f| f.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_client.is_empty()
    }

    /// Distinct masks currently probed per match
    pub fn mask_count(&self) -> usize {
        self.inner.read().wildcard.len()
    }
}
