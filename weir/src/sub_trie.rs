// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Subscription index.
//!
//! Keeps every `(client, filter)` subscription exactly once and answers
//! "which subscriptions match this topic". A linear scan over parsed
//! filters is plenty at broker scale; a level trie would only pay off
//! far beyond it.

use codec::topic::{split_share, Topic};
use codec::v5::RetainHandling;
use codec::QoS;
use std::collections::HashMap;

use crate::error::{Error, ErrorKind};

/// One subscription entry.
#[derive(Debug, Clone)]
pub struct Subscription {
    client_id: String,

    /// Raw filter as subscribed, including any `$share/{group}/` prefix.
    filter: String,

    /// Parsed match filter, share prefix stripped.
    topic: Topic,

    share_name: Option<String>,

    qos: QoS,
    no_local: bool,
    retain_as_published: bool,
    retain_handling: RetainHandling,
    subscription_id: Option<usize>,
}

impl Subscription {
    /// Build a subscription from a raw filter string.
    ///
    /// # Errors
    ///
    /// Returns error if the filter or share name is invalid.
    pub fn parse(
        client_id: &str,
        filter: &str,
        qos: QoS,
        no_local: bool,
        retain_as_published: bool,
        retain_handling: RetainHandling,
        subscription_id: Option<usize>,
    ) -> Result<Self, Error> {
        let (share_name, match_filter) = split_share(filter).map_err(|err| {
            Error::from_string(
                ErrorKind::DecodeError,
                format!("Invalid topic filter {filter}: {err:?}"),
            )
        })?;
        let topic = Topic::parse(match_filter).map_err(|err| {
            Error::from_string(
                ErrorKind::DecodeError,
                format!("Invalid topic filter {filter}: {err:?}"),
            )
        })?;
        Ok(Self {
            client_id: client_id.to_string(),
            filter: filter.to_string(),
            topic,
            share_name: share_name.map(ToString::to_string),
            qos,
            no_local,
            retain_as_published,
            retain_handling,
            subscription_id,
        })
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn filter(&self) -> &str {
        &self.filter
    }

    #[must_use]
    pub const fn topic(&self) -> &Topic {
        &self.topic
    }

    #[must_use]
    pub fn share_name(&self) -> Option<&str> {
        self.share_name.as_deref()
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    #[must_use]
    pub const fn no_local(&self) -> bool {
        self.no_local
    }

    #[must_use]
    pub const fn retain_as_published(&self) -> bool {
        self.retain_as_published
    }

    #[must_use]
    pub const fn retain_handling(&self) -> RetainHandling {
        self.retain_handling
    }

    #[must_use]
    pub const fn subscription_id(&self) -> Option<usize> {
        self.subscription_id
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.share_name.is_some()
    }
}

/// The broker wide subscription index.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default)]
pub struct SubTrie {
    map: HashMap<String, HashMap<String, Subscription>>,
}

impl SubTrie {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Insert a subscription, replacing any existing entry with the same
    /// `(client, filter)` pair.
    ///
    /// Returns true if an entry was replaced; the caller uses this for
    /// retain-handling semantics.
    pub fn insert(&mut self, subscription: Subscription) -> bool {
        let filters = self
            .map
            .entry(subscription.client_id.clone())
            .or_default();
        filters
            .insert(subscription.filter.clone(), subscription)
            .is_some()
    }

    /// Remove the `(client, filter)` entry, returns true if it existed.
    pub fn remove(&mut self, client_id: &str, filter: &str) -> bool {
        let Some(filters) = self.map.get_mut(client_id) else {
            return false;
        };
        let removed = filters.remove(filter).is_some();
        if filters.is_empty() {
            self.map.remove(client_id);
        }
        removed
    }

    /// Remove all subscriptions of `client_id`, returning the removed
    /// filter strings.
    pub fn remove_client(&mut self, client_id: &str) -> Vec<String> {
        self.map
            .remove(client_id)
            .map(|filters| filters.into_keys().collect())
            .unwrap_or_default()
    }

    /// Every subscription whose filter matches `topic`.
    #[must_use]
    pub fn matches(&self, topic: &str) -> Vec<&Subscription> {
        self.map
            .values()
            .flat_map(HashMap::values)
            .filter(|subscription| subscription.topic.is_match(topic))
            .collect()
    }

    #[must_use]
    pub fn get(&self, client_id: &str, filter: &str) -> Option<&Subscription> {
        self.map.get(client_id)?.get(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(client_id: &str, filter: &str, qos: QoS) -> Subscription {
        Subscription::parse(
            client_id,
            filter,
            qos,
            false,
            false,
            RetainHandling::Send,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_insert_replaces() {
        let mut trie = SubTrie::new();
        assert!(!trie.insert(subscription("c1", "t/+", QoS::AtMostOnce)));
        assert!(trie.insert(subscription("c1", "t/+", QoS::AtLeastOnce)));
        assert_eq!(trie.get("c1", "t/+").unwrap().qos(), QoS::AtLeastOnce);
        assert_eq!(trie.matches("t/x").len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut trie = SubTrie::new();
        trie.insert(subscription("c1", "t/+", QoS::AtMostOnce));
        assert!(trie.remove("c1", "t/+"));
        assert!(!trie.remove("c1", "t/+"));
        assert_eq!(trie.matches("t/x").len(), 0);
    }

    #[test]
    fn test_remove_client() {
        let mut trie = SubTrie::new();
        trie.insert(subscription("c1", "a/#", QoS::AtMostOnce));
        trie.insert(subscription("c1", "b", QoS::AtMostOnce));
        trie.insert(subscription("c2", "a/#", QoS::AtMostOnce));
        let mut removed = trie.remove_client("c1");
        removed.sort();
        assert_eq!(removed, vec!["a/#".to_string(), "b".to_string()]);
        assert_eq!(trie.matches("a/x").len(), 1);
    }

    #[test]
    fn test_shared_subscription_entry() {
        let mut trie = SubTrie::new();
        trie.insert(subscription("c1", "$share/g/t/#", QoS::AtLeastOnce));
        let matched: Vec<&Subscription> = trie.matches("t/x");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].share_name(), Some("g"));
        assert_eq!(matched[0].filter(), "$share/g/t/#");

        // A plain and a shared subscription on the same filter coexist.
        trie.insert(subscription("c1", "t/#", QoS::AtLeastOnce));
        assert_eq!(trie.matches("t/x").len(), 2);
    }
}
