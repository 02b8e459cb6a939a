//! Relay configuration document: which channel to read, where to forward,
//! and who may control the relay.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Reference to a channel on the messaging platform.
///
/// Either a numeric chat ID (`-1001234567890`) or a public handle
/// (`@my_channel`). Handles are resolved by the platform client at use time.
/// Stored values are normalized through [`ChannelRef::parse`] on load, so a
/// quoted ID still becomes [`ChannelRef::Id`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum ChannelRef {
    /// Numeric chat identifier.
    Id(i64),
    /// Public channel handle.
    Handle(String),
}

impl ChannelRef {
    /// Parse operator input into a channel reference.
    ///
    /// Integers become [`ChannelRef::Id`]; anything else is treated as a handle
    /// and normalized to carry a leading `@`. Returns `None` for blank input.
    ///
    /// # Examples
    ///
    /// ```
    /// use courier_core::relay_config::ChannelRef;
    ///
    /// assert_eq!(ChannelRef::parse("-100123"), Some(ChannelRef::Id(-100123)));
    /// assert_eq!(ChannelRef::parse("news"), Some(ChannelRef::Handle("@news".into())));
    /// assert_eq!(ChannelRef::parse("  "), None);
    /// ```
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        let value = input.trim();
        if value.is_empty() {
            return None;
        }
        if let Ok(id) = value.parse::<i64>() {
            return Some(Self::Id(id));
        }
        let handle = value.trim_start_matches('@');
        if handle.is_empty() {
            return None;
        }
        Some(Self::Handle(format!("@{handle}")))
    }

    /// Lookup key shared by IDs and handles (handles are case-insensitive).
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Id(id) => id.to_string(),
            Self::Handle(handle) => handle.trim_start_matches('@').to_lowercase(),
        }
    }
}

impl<'de> Deserialize<'de> for ChannelRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawId::deserialize(deserializer)? {
            RawId::Number(id) => Ok(Self::Id(id)),
            RawId::Text(text) => Self::parse(&text).ok_or_else(|| {
                serde::de::Error::custom(format!("invalid channel reference: {text:?}"))
            }),
        }
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Handle(handle) => f.write_str(handle),
        }
    }
}

/// Identity of the relay operator.
///
/// Persisted as a string, accepted as either a number or a numeric string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawId", into = "String")]
pub struct OperatorId(i64);

impl OperatorId {
    /// Wrap a platform user ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// The platform user ID.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Parse a user ID from text, ignoring surrounding whitespace.
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        input.trim().parse::<i64>().ok().map(Self)
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<OperatorId> for String {
    fn from(id: OperatorId) -> Self {
        id.0.to_string()
    }
}

/// A number, or text that may hold one.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(i64),
    Text(String),
}

impl TryFrom<RawId> for OperatorId {
    type Error = String;

    fn try_from(raw: RawId) -> Result<Self, Self::Error> {
        match raw {
            RawId::Number(id) => Ok(Self(id)),
            RawId::Text(text) => {
                Self::parse(&text).ok_or_else(|| format!("invalid operator id: {text:?}"))
            }
        }
    }
}

/// Persisted relay configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Channel messages are read from.
    #[serde(default)]
    pub source: Option<ChannelRef>,
    /// Channel messages are forwarded to.
    #[serde(default)]
    pub target: Option<ChannelRef>,
    /// The only identity allowed to issue control commands.
    #[serde(default)]
    pub admin: Option<OperatorId>,
}

/// Which side of the relay is missing from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingChannel {
    /// No source channel configured.
    Source,
    /// No target channel configured.
    Target,
    /// Neither channel configured.
    Both,
}

impl fmt::Display for MissingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Source => "source",
            Self::Target => "target",
            Self::Both => "source and target",
        })
    }
}

impl RelayConfig {
    /// Both endpoints, if the relay is fully configured.
    ///
    /// # Errors
    ///
    /// Returns which channel is missing when either side is unset.
    pub fn channels(&self) -> Result<(ChannelRef, ChannelRef), MissingChannel> {
        match (&self.source, &self.target) {
            (Some(source), Some(target)) => Ok((source.clone(), target.clone())),
            (None, Some(_)) => Err(MissingChannel::Source),
            (Some(_), None) => Err(MissingChannel::Target),
            (None, None) => Err(MissingChannel::Both),
        }
    }
}
