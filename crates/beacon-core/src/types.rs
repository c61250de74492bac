use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::BeaconError;

/// Number of leading peer-id characters used as the compact short id.
pub const PEER_SHORT_ID_LEN: usize = 8;

/// Substrate-level address of a remote device (stable per substrate session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(pub String);

impl PeerAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Application-level peer identifier, stable across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Parses a lowercase hex peer id as carried in record fields.
    pub fn parse(value: &str) -> Result<Self, BeaconError> {
        let value = value.trim();
        if value.len() < PEER_SHORT_ID_LEN {
            return Err(BeaconError::MalformedId(value.to_string()));
        }
        if !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BeaconError::MalformedId(value.to_string()));
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    pub(crate) fn from_hex_unchecked(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compact prefix used in message ids and reconciliation targets.
    pub fn short(&self) -> &str {
        &self.0[..PEER_SHORT_ID_LEN.min(self.0.len())]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-process-lifetime token: hex-encoded unix seconds at startup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionEpoch(String);

impl SessionEpoch {
    pub fn from_unix_secs(secs: u64) -> Self {
        Self(format!("{secs:x}"))
    }

    /// Wraps an epoch observed on the wire. Unparsable values are kept so the
    /// lexical fallback of [`SessionEpoch::is_newer_than`] can still order them.
    pub fn from_wire(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn as_number(&self) -> Option<u64> {
        u64::from_str_radix(&self.0, 16).ok()
    }

    /// Returns true when `self` denotes a later process start than `other`.
    ///
    /// Both sides are compared as hex integers when possible; if only one
    /// side parses, that side is newer; otherwise the strings are compared
    /// lexically.
    pub fn is_newer_than(&self, other: &SessionEpoch) -> bool {
        self.compare(other) == Ordering::Greater
    }

    pub fn compare(&self, other: &SessionEpoch) -> Ordering {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl fmt::Display for SessionEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message identifier: `<shortId>_<sessionEpoch>_<counter>`.
///
/// Unique across devices and across restarts of one device, and tells any
/// receiver which sender session it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(sender: &PeerId, epoch: &SessionEpoch, counter: u64) -> Self {
        Self(format!("{}{}", Self::session_prefix(sender, epoch), counter))
    }

    /// Wraps an id received on the wire without validating its shape.
    pub fn from_wire(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Prefix shared by every id minted by `sender` during `epoch`.
    pub fn session_prefix(sender: &PeerId, epoch: &SessionEpoch) -> String {
        format!("{}_{}_", sender.short(), epoch.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id was minted by `sender` during `epoch`.
    pub fn belongs_to(&self, sender: &PeerId, epoch: &SessionEpoch) -> bool {
        self.0.starts_with(&Self::session_prefix(sender, epoch))
    }

    /// Splits the id into `(short_id, epoch, counter)`.
    pub fn parts(&self) -> Result<(&str, SessionEpoch, u64), BeaconError> {
        let mut it = self.0.splitn(3, '_');
        let (Some(short), Some(epoch), Some(counter)) = (it.next(), it.next(), it.next()) else {
            return Err(BeaconError::MalformedId(self.0.clone()));
        };
        let counter = counter
            .parse::<u64>()
            .map_err(|_| BeaconError::MalformedId(self.0.clone()))?;
        if short.is_empty() || epoch.is_empty() {
            return Err(BeaconError::MalformedId(self.0.clone()));
        }
        Ok((short, SessionEpoch::from_wire(epoch), counter))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::{MessageId, PeerId, SessionEpoch};
    use crate::error::BeaconError;

    fn peer() -> PeerId {
        PeerId::parse("a1b2c3d4e5f60718").expect("valid peer id")
    }

    #[test]
    fn peer_id_rejects_non_hex_and_short_values() {
        assert!(matches!(
            PeerId::parse("xyz"),
            Err(BeaconError::MalformedId(_))
        ));
        assert!(PeerId::parse("zzzzzzzzzzzz").is_err());
        assert_eq!(peer().short(), "a1b2c3d4");
    }

    #[test]
    fn numeric_epochs_compare_as_hex_integers() {
        let old = SessionEpoch::from_unix_secs(0x6500_0000);
        let new = SessionEpoch::from_unix_secs(0x6500_0001);
        assert!(new.is_newer_than(&old));
        assert!(!old.is_newer_than(&new));
        assert!(!old.is_newer_than(&old));

        // "ff" < "100" lexically but not numerically.
        assert!(SessionEpoch::from_wire("100").is_newer_than(&SessionEpoch::from_wire("ff")));
    }

    #[test]
    fn parsable_epoch_beats_unparsable_and_lexical_fallback_applies() {
        let parsable = SessionEpoch::from_wire("65000000");
        let garbage = SessionEpoch::from_wire("zz-top");
        assert!(parsable.is_newer_than(&garbage));
        assert!(!garbage.is_newer_than(&parsable));
        assert!(SessionEpoch::from_wire("zzb").is_newer_than(&SessionEpoch::from_wire("zza")));
    }

    #[test]
    fn message_id_is_self_describing() {
        let epoch = SessionEpoch::from_unix_secs(0x6500_0000);
        let id = MessageId::new(&peer(), &epoch, 7);
        assert_eq!(id.as_str(), "a1b2c3d4_65000000_7");
        assert!(id.belongs_to(&peer(), &epoch));
        assert!(!id.belongs_to(&peer(), &SessionEpoch::from_unix_secs(1)));

        let (short, parsed_epoch, counter) = id.parts().expect("id should parse");
        assert_eq!(short, "a1b2c3d4");
        assert_eq!(parsed_epoch, epoch);
        assert_eq!(counter, 7);
        assert!(MessageId::from_wire("nope").parts().is_err());
    }
}
