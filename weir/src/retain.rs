// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Retained message store.

use codec::topic::Topic;
use std::collections::HashMap;
use std::time::Instant;

use crate::types::Message;

/// A retained publish together with the client that stored it.
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub message: Message,

    /// Client id of the publisher, used for the no-local check when
    /// retained messages are delivered at subscribe time.
    pub origin: String,
}

/// Maps exact topic names to their retained message.
#[derive(Debug, Default)]
pub struct RetainStore {
    map: HashMap<String, RetainedMessage>,
}

impl RetainStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Store `message` as the retained message for its topic.
    ///
    /// A zero length payload removes the stored message instead
    /// [MQTT-3.3.1-6], [MQTT-3.3.1-7].
    pub fn set(&mut self, message: &Message, origin: &str) {
        if message.payload.is_empty() {
            self.map.remove(&message.topic);
        } else {
            self.map.insert(
                message.topic.clone(),
                RetainedMessage {
                    message: message.clone(),
                    origin: origin.to_string(),
                },
            );
        }
    }

    /// Drop entries whose message expiry interval has elapsed.
    pub fn sweep(&mut self, now: Instant) {
        self.map.retain(|_topic, entry| !entry.message.is_expired(now));
    }

    /// All retained messages matching `filter`, after sweeping expired
    /// entries.
    pub fn matching(&mut self, filter: &Topic, now: Instant) -> Vec<&RetainedMessage> {
        self.sweep(now);
        self.map
            .values()
            .filter(|entry| filter.is_match(&entry.message.topic))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{Bytes, Properties, QoS};
    use std::time::Duration;

    fn message(topic: &str, payload: &'static [u8]) -> Message {
        Message {
            topic: topic.to_string(),
            qos: QoS::AtMostOnce,
            retain: true,
            payload: Bytes::from_static(payload),
            properties: Properties::new(),
            received_at: Instant::now(),
        }
    }

    #[test]
    fn test_set_and_match() {
        let mut store = RetainStore::new();
        store.set(&message("r/a", b"A"), "c1");
        store.set(&message("r/b", b"B"), "c2");

        let filter = Topic::parse("r/+").unwrap();
        let matched = store.matching(&filter, Instant::now());
        assert_eq!(matched.len(), 2);

        let filter = Topic::parse("r/a").unwrap();
        let matched = store.matching(&filter, Instant::now());
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].origin, "c1");
    }

    #[test]
    fn test_empty_payload_removes() {
        let mut store = RetainStore::new();
        store.set(&message("r", b"A"), "c1");
        assert_eq!(store.len(), 1);

        store.set(&message("r", b""), "c1");
        assert!(store.is_empty());
    }

    #[test]
    fn test_overwrite() {
        let mut store = RetainStore::new();
        store.set(&message("r", b"A"), "c1");
        store.set(&message("r", b"B"), "c2");
        assert_eq!(store.len(), 1);

        let filter = Topic::parse("r").unwrap();
        let matched = store.matching(&filter, Instant::now());
        assert_eq!(matched[0].message.payload.as_ref(), b"B");
        assert_eq!(matched[0].origin, "c2");
    }

    #[test]
    fn test_sweep_expired() {
        let mut store = RetainStore::new();
        let mut expiring = message("r", b"A");
        expiring.properties.set_message_expiry_interval(1);
        store.set(&expiring, "c1");
        store.set(&message("s", b"B"), "c1");

        let later = Instant::now() + Duration::from_secs(2);
        store.sweep(later);
        assert_eq!(store.len(), 1);

        let filter = Topic::parse("#").unwrap();
        let matched = store.matching(&filter, later);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].message.topic, "s");
    }
}
