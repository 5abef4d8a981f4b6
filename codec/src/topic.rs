// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Topic name and topic filter handling.
//!
//! Rules are defined in protocol chapter 4.7, `Topic Names and Topic Filters`.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;

use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

/// Prefix of shared subscription filters.
pub const SHARE_PREFIX: &str = "$share/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    EmptyTopic,
    TooManyData,
    InvalidChar,
    ContainsWildChar,

    /// Share name in a `$share/{name}/{filter}` filter is empty or
    /// contains `/`, `+` or `#`.
    InvalidShareName,
}

/// Validate topic filter.
///
/// ```
/// use weir_codec::topic::validate_sub_topic;
/// assert!(validate_sub_topic("sport/tennis/player/#").is_ok());
/// assert!(validate_sub_topic("sport/tennis/player#").is_err());
/// assert!(validate_sub_topic("#").is_ok());
/// assert!(validate_sub_topic("sport/#/player/ranking").is_err());
/// assert!(validate_sub_topic("+").is_ok());
/// assert!(validate_sub_topic("sport+").is_err());
/// ```
///
/// # Errors
///
/// Returns error if `topic` contains misplaced wildcard characters.
pub fn validate_sub_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if topic.len() > usize::from(u16::MAX) {
        return Err(TopicError::TooManyData);
    }
    if topic.contains('\u{0000}') {
        return Err(TopicError::InvalidChar);
    }

    let bytes = topic.as_bytes();
    for (index, b) in bytes.iter().enumerate() {
        if b == &b'#' {
            // Must have a prefix level separator.
            if index > 0 && bytes[index - 1] != b'/' {
                return Err(TopicError::InvalidChar);
            }

            // Must be the last level [MQTT-4.7.1-2].
            if index != bytes.len() - 1 {
                return Err(TopicError::InvalidChar);
            }
        } else if b == &b'+' {
            // Must occupy an entire level [MQTT-4.7.1-3].
            if index > 0 && bytes[index - 1] != b'/' {
                return Err(TopicError::InvalidChar);
            }
            if index + 1 < bytes.len() && bytes[index + 1] != b'/' {
                return Err(TopicError::InvalidChar);
            }
        }
    }

    Ok(())
}

/// Check that a topic name contains no wildcard characters and no NUL.
///
/// ```
/// use weir_codec::topic::validate_pub_topic;
/// assert!(validate_pub_topic("sport/tennis/player/ranking").is_ok());
/// assert!(validate_pub_topic("sport/tennis/player/#").is_err());
/// ```
///
/// # Errors
///
/// Returns error if `topic` is empty, too long or contains `+`, `#` or NUL.
pub fn validate_pub_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if topic.len() > usize::from(u16::MAX) {
        return Err(TopicError::TooManyData);
    }
    if topic.contains('\u{0000}') {
        return Err(TopicError::InvalidChar);
    }

    if topic.bytes().any(|c| c == b'+' || c == b'#') {
        Err(TopicError::ContainsWildChar)
    } else {
        Ok(())
    }
}

/// Split a shared subscription filter into `(share_name, filter)`.
///
/// A filter of the form `$share/{name}/{filter}` subscribes the client to
/// `{filter}` as a member of share group `{name}`. Non-shared filters are
/// returned unchanged with share name `None`.
///
/// # Errors
///
/// Returns error if the share name is empty or contains `/`, `+` or `#`,
/// or the remaining filter is empty.
pub fn split_share(filter: &str) -> Result<(Option<&str>, &str), TopicError> {
    let Some(rest) = filter.strip_prefix(SHARE_PREFIX) else {
        return Ok((None, filter));
    };
    let Some((share_name, match_filter)) = rest.split_once('/') else {
        return Err(TopicError::InvalidShareName);
    };
    if share_name.is_empty() || share_name.contains(['+', '#']) {
        return Err(TopicError::InvalidShareName);
    }
    if match_filter.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    Ok((Some(share_name), match_filter))
}

/// One level in a parsed topic filter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TopicPart {
    /// Normal part.
    Normal(String),

    /// Empty part.
    Empty,

    /// `#` char, to match any remaining levels.
    MultiWildcard,

    /// `+` char, to match one level.
    SingleWildcard,
}

impl TopicPart {
    fn has_wildcard(s: &str) -> bool {
        s.contains(['#', '+'])
    }

    fn parse(s: &str) -> Result<Self, TopicError> {
        match s {
            "" => Ok(Self::Empty),
            "+" => Ok(Self::SingleWildcard),
            "#" => Ok(Self::MultiWildcard),
            _ => {
                if Self::has_wildcard(s) {
                    Err(TopicError::ContainsWildChar)
                } else {
                    Ok(Self::Normal(s.to_string()))
                }
            }
        }
    }
}

impl Default for TopicPart {
    fn default() -> Self {
        Self::Empty
    }
}

/// A parsed topic filter, split on `/` into levels.
#[derive(Debug, Default, Clone, Eq, PartialOrd, Ord, Hash)]
pub struct Topic {
    topic: String,
    parts: Vec<TopicPart>,
}

impl PartialEq for Topic {
    fn eq(&self, other: &Self) -> bool {
        self.topic.eq(&other.topic)
    }
}

impl Topic {
    /// Parse a topic filter.
    ///
    /// # Errors
    ///
    /// Returns error if `s` violates filter rules.
    pub fn parse(s: &str) -> Result<Self, TopicError> {
        validate_sub_topic(s)?;
        let parts = s
            .split('/')
            .map(TopicPart::parse)
            .collect::<Result<Vec<_>, TopicError>>()?;
        Ok(Self {
            topic: s.to_string(),
            parts,
        })
    }

    /// Check whether topic name `s` matches this filter.
    ///
    /// Topics starting with `$` never match a filter whose first level is
    /// a wildcard [MQTT-4.7.2-1].
    #[must_use]
    pub fn is_match(&self, s: &str) -> bool {
        if s.starts_with('$')
            && matches!(
                self.parts.first(),
                Some(TopicPart::SingleWildcard | TopicPart::MultiWildcard)
            )
        {
            return false;
        }

        let levels: Vec<&str> = s.split('/').collect();
        let mut index = 0;
        for part in &self.parts {
            match part {
                // `#` matches the parent level as well: `sport/#` matches `sport`.
                TopicPart::MultiWildcard => return true,
                TopicPart::SingleWildcard => {
                    if index >= levels.len() {
                        return false;
                    }
                    index += 1;
                }
                TopicPart::Normal(filter_level) => {
                    if index >= levels.len() || filter_level != levels[index] {
                        return false;
                    }
                    index += 1;
                }
                TopicPart::Empty => {
                    if index >= levels.len() || !levels[index].is_empty() {
                        return false;
                    }
                    index += 1;
                }
            }
        }
        index == levels.len()
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.topic.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topic.is_empty()
    }
}

/// Topic name in publish packets. Contains no wildcard characters.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PubTopic(String);

impl PubTopic {
    /// Create a new topic name.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid.
    pub fn new(topic: &str) -> Result<Self, TopicError> {
        validate_pub_topic(topic)?;
        Ok(Self(topic.to_string()))
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<str> for PubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl DecodePacket for PubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let s = ba.read_string(len as usize)?;
        validate_pub_topic(&s)?;
        Ok(Self(s))
    }
}

impl EncodePacket for PubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        let len = self.0.len() as u16;
        buf.write_u16::<BigEndian>(len)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(self.bytes())
    }
}

/// Topic filter in subscribe/unsubscribe packets. May contain wildcards
/// and a `$share/{name}/` prefix.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubTopic(String);

impl SubTopic {
    /// Create a new topic filter.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid.
    pub fn new(topic: &str) -> Result<Self, TopicError> {
        let (_share_name, match_filter) = split_share(topic)?;
        validate_sub_topic(match_filter)?;
        Ok(Self(topic.to_string()))
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<str> for SubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl DecodePacket for SubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let s = ba.read_string(len as usize)?;
        let (_share_name, match_filter) = split_share(&s)?;
        validate_sub_topic(match_filter)?;
        Ok(Self(s))
    }
}

impl EncodePacket for SubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        let len = self.0.len() as u16;
        buf.write_u16::<BigEndian>(len)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(self.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_sub_topic() {
        assert!(validate_sub_topic("sport/tennis/#").is_ok());
        assert!(validate_sub_topic("+/tennis/+").is_ok());
        assert!(validate_sub_topic("sport/+/player1").is_ok());
        assert!(validate_sub_topic("").is_err());
        assert!(validate_sub_topic("sport/tennis#").is_err());
        assert!(validate_sub_topic("sport/#/ranking").is_err());
        assert!(validate_sub_topic("sp+ort").is_err());
    }

    #[test]
    fn test_validate_pub_topic() {
        assert!(validate_pub_topic("sport/tennis").is_ok());
        assert!(validate_pub_topic("/").is_ok());
        assert!(validate_pub_topic("").is_err());
        assert!(validate_pub_topic("sport/+").is_err());
        assert!(validate_pub_topic("a\u{0000}b").is_err());
    }

    #[test]
    fn test_split_share() {
        assert_eq!(split_share("a/b"), Ok((None, "a/b")));
        assert_eq!(split_share("$share/g/t/#"), Ok((Some("g"), "t/#")));
        assert_eq!(
            split_share("$share//t"),
            Err(TopicError::InvalidShareName)
        );
        assert_eq!(
            split_share("$share/g+/t"),
            Err(TopicError::InvalidShareName)
        );
        assert_eq!(split_share("$share/g/"), Err(TopicError::EmptyTopic));
        assert_eq!(split_share("$share/g"), Err(TopicError::InvalidShareName));
    }

    #[test]
    fn test_topic_match() {
        let filter = Topic::parse("sport/tennis/player1/#").unwrap();
        assert!(filter.is_match("sport/tennis/player1"));
        assert!(filter.is_match("sport/tennis/player1/ranking"));
        assert!(filter.is_match("sport/tennis/player1/score/wimbledon"));
        assert!(!filter.is_match("sport/tennis/player2"));

        let filter = Topic::parse("sport/+").unwrap();
        assert!(filter.is_match("sport/"));
        assert!(filter.is_match("sport/tennis"));
        assert!(!filter.is_match("sport"));
        assert!(!filter.is_match("sport/tennis/player1"));

        let filter = Topic::parse("+/+").unwrap();
        assert!(filter.is_match("/finance"));

        let filter = Topic::parse("/+").unwrap();
        assert!(filter.is_match("/finance"));
        assert!(!filter.is_match("finance"));
    }

    #[test]
    fn test_sys_topic_match() {
        // [MQTT-4.7.2-1]
        let filter = Topic::parse("#").unwrap();
        assert!(!filter.is_match("$SYS/uptime"));

        let filter = Topic::parse("+/monitor/clients").unwrap();
        assert!(!filter.is_match("$SYS/monitor/clients"));

        let filter = Topic::parse("$SYS/#").unwrap();
        assert!(filter.is_match("$SYS/uptime"));

        let filter = Topic::parse("$SYS/monitor/+").unwrap();
        assert!(filter.is_match("$SYS/monitor/clients"));
    }
}
