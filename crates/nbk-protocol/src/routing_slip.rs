//! Append-only records of the kernels a command or event has passed through.
//!
//! Both slip variants share membership, prefix and continuation logic; they differ
//! only in how a stamp is validated. Command slips track a two-phase lifecycle per
//! kernel (`uri?tag=arrived`, then the plain `uri` on departure) while event slips
//! take a single stamp per kernel.

use std::fmt;
use std::marker::PhantomData;

use crate::error::ProtocolError;
use crate::uri::{create_kernel_uri, create_kernel_uri_with_query, with_tag};

const ARRIVED_TAG: &str = "arrived";

/// Stamping rule distinguishing the two slip variants.
pub trait StampRule {
    fn stamp(uris: &mut Vec<String>, uri: &str) -> Result<(), ProtocolError>;
}

/// Two-phase `arrived -> departed` stamping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandStamp;

/// Single-phase stamping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStamp;

pub struct RoutingSlip<R> {
    uris: Vec<String>,
    rule: PhantomData<R>,
}

pub type CommandRoutingSlip = RoutingSlip<CommandStamp>;
pub type EventRoutingSlip = RoutingSlip<EventStamp>;

impl<R: StampRule> RoutingSlip<R> {
    pub fn new() -> Self {
        Self {
            uris: Vec::new(),
            rule: PhantomData,
        }
    }

    /// Builds a slip from entries that are already known to be consistent, such as
    /// a snapshot taken from another slip.
    pub(crate) fn from_trusted(uris: Vec<String>) -> Self {
        Self {
            uris,
            rule: PhantomData,
        }
    }

    /// Builds a slip from untrusted entries, rejecting duplicates.
    pub fn from_uris(uris: &[String]) -> Result<Self, ProtocolError> {
        let mut slip = Self::new();
        slip.continue_with(uris)?;
        Ok(slip)
    }

    pub fn stamp(&mut self, uri: &str) -> Result<(), ProtocolError> {
        R::stamp(&mut self.uris, uri)
    }

    pub fn contains(&self, uri: &str, ignore_query: bool) -> bool {
        self.index_of(uri, ignore_query).is_some()
    }

    pub fn index_of(&self, uri: &str, ignore_query: bool) -> Option<usize> {
        let normalize = if ignore_query {
            create_kernel_uri
        } else {
            create_kernel_uri_with_query
        };
        let wanted = normalize(uri);
        self.uris.iter().position(|entry| normalize(entry) == wanted)
    }

    /// True when the first `other.len()` entries of this slip equal `other`.
    pub fn starts_with(&self, other: &[String]) -> bool {
        uris_start_with(&self.uris, other)
    }

    /// Appends the part of `other` this slip has not seen yet.
    ///
    /// When `other` already begins with this slip's entries only the remaining suffix
    /// is appended. Every appended entry must be new to this slip; on conflict the
    /// slip is left untouched.
    pub fn continue_with(&mut self, other: &[String]) -> Result<(), ProtocolError> {
        let suffix = if uris_start_with(other, &self.uris) {
            &other[self.uris.len()..]
        } else {
            other
        };
        let mut merged = self.uris.clone();
        for uri in suffix {
            let normalized = create_kernel_uri_with_query(uri);
            if merged
                .iter()
                .any(|entry| create_kernel_uri_with_query(entry) == normalized)
            {
                return Err(ProtocolError::ContinuationConflict {
                    uri: uri.clone(),
                    slip: self.uris.clone(),
                    other: other.to_vec(),
                });
            }
            merged.push(uri.clone());
        }
        self.uris = merged;
        Ok(())
    }

    pub fn as_slice(&self) -> &[String] {
        &self.uris
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.uris.clone()
    }

    pub fn len(&self) -> usize {
        self.uris.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }
}

impl RoutingSlip<CommandStamp> {
    /// Records that the command reached the kernel at `uri`.
    pub fn stamp_as_arrived(&mut self, uri: &str) -> Result<(), ProtocolError> {
        let plain = create_kernel_uri(uri);
        let tagged = with_tag(uri, ARRIVED_TAG);
        if self
            .uris
            .iter()
            .any(|entry| create_kernel_uri(entry) == plain)
        {
            return Err(ProtocolError::DuplicateEntry {
                uri: tagged,
                slip: self.uris.clone(),
            });
        }
        self.uris.push(tagged);
        Ok(())
    }
}

impl StampRule for CommandStamp {
    fn stamp(uris: &mut Vec<String>, uri: &str) -> Result<(), ProtocolError> {
        let plain = create_kernel_uri(uri);
        let tagged = with_tag(uri, ARRIVED_TAG);
        if !uris
            .iter()
            .any(|entry| create_kernel_uri_with_query(entry) == tagged)
        {
            return Err(ProtocolError::NotArrived {
                uri: tagged,
                slip: uris.clone(),
            });
        }
        if uris
            .iter()
            .any(|entry| create_kernel_uri_with_query(entry) == plain)
        {
            return Err(ProtocolError::DuplicateEntry {
                uri: plain,
                slip: uris.clone(),
            });
        }
        uris.push(plain);
        Ok(())
    }
}

impl StampRule for EventStamp {
    fn stamp(uris: &mut Vec<String>, uri: &str) -> Result<(), ProtocolError> {
        let normalized = create_kernel_uri_with_query(uri);
        if uris
            .iter()
            .any(|entry| create_kernel_uri_with_query(entry) == normalized)
        {
            return Err(ProtocolError::DuplicateEntry {
                uri: normalized,
                slip: uris.clone(),
            });
        }
        uris.push(normalized);
        Ok(())
    }
}

fn uris_start_with(uris: &[String], prefix: &[String]) -> bool {
    !prefix.is_empty()
        && uris.len() >= prefix.len()
        && uris
            .iter()
            .zip(prefix)
            .all(|(a, b)| create_kernel_uri_with_query(a) == create_kernel_uri_with_query(b))
}

impl<R: StampRule> Default for RoutingSlip<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Clone for RoutingSlip<R> {
    fn clone(&self) -> Self {
        Self {
            uris: self.uris.clone(),
            rule: PhantomData,
        }
    }
}

impl<R> PartialEq for RoutingSlip<R> {
    fn eq(&self, other: &Self) -> bool {
        self.uris == other.uris
    }
}

impl<R> Eq for RoutingSlip<R> {}

impl<R> fmt::Debug for RoutingSlip<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.uris).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uris(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn command_slip_requires_arrival_before_departure() {
        let mut slip = CommandRoutingSlip::new();
        let err = slip.stamp("kernel://local/js").unwrap_err();
        assert!(err.to_string().contains("not in the routing slip"));

        slip.stamp_as_arrived("kernel://local/js").unwrap();
        slip.stamp("kernel://local/js").unwrap();
        assert_eq!(
            slip.to_vec(),
            uris(&["kernel://local/js?tag=arrived", "kernel://local/js"])
        );
        assert!(slip.contains("kernel://local/js", false));
    }

    #[test]
    fn command_slip_rejects_second_arrival_and_departure() {
        let mut slip = CommandRoutingSlip::new();
        slip.stamp_as_arrived("kernel://local/js").unwrap();
        assert!(slip.stamp_as_arrived("kernel://local/js").is_err());
        slip.stamp("kernel://local/js").unwrap();
        assert!(slip.stamp("kernel://local/js").is_err());
    }

    #[test]
    fn arrival_check_does_not_confuse_sibling_paths() {
        let mut slip = CommandRoutingSlip::new();
        slip.stamp_as_arrived("kernel://local/root/js").unwrap();
        slip.stamp_as_arrived("kernel://local/root").unwrap();
        slip.stamp_as_arrived("kernel://local/ro").unwrap();
        assert_eq!(slip.len(), 3);
    }

    #[test]
    fn event_slip_stamps_once() {
        let mut slip = EventRoutingSlip::new();
        slip.stamp("kernel://local/js").unwrap();
        assert!(slip.contains("kernel://local/js", false));
        let err = slip.stamp("kernel://local/js").unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateEntry { .. }));
    }

    #[test]
    fn contains_can_ignore_query() {
        let mut slip = CommandRoutingSlip::new();
        slip.stamp_as_arrived("kernel://local/js").unwrap();
        assert!(!slip.contains("kernel://local/js", false));
        assert!(slip.contains("kernel://local/js", true));
    }

    #[test]
    fn continue_with_appends_only_the_unseen_suffix() {
        let mut slip = EventRoutingSlip::from_uris(&uris(&["kernel://a/", "kernel://b/"])).unwrap();
        slip.continue_with(&uris(&["kernel://a/", "kernel://b/", "kernel://c/"]))
            .unwrap();
        assert_eq!(
            slip.to_vec(),
            uris(&["kernel://a/", "kernel://b/", "kernel://c/"])
        );
    }

    #[test]
    fn continue_with_appends_disjoint_slip() {
        let mut slip = EventRoutingSlip::from_uris(&uris(&["kernel://a/", "kernel://b/"])).unwrap();
        slip.continue_with(&uris(&["kernel://c/"])).unwrap();
        assert_eq!(
            slip.to_vec(),
            uris(&["kernel://a/", "kernel://b/", "kernel://c/"])
        );
    }

    #[test]
    fn continue_with_rejects_reordered_overlap() {
        let mut slip = EventRoutingSlip::from_uris(&uris(&["kernel://a/", "kernel://b/"])).unwrap();
        let err = slip
            .continue_with(&uris(&["kernel://b/", "kernel://c/"]))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ContinuationConflict { .. }));
        assert_eq!(slip.len(), 2);
    }

    #[test]
    fn starts_with_compares_normalized_entries() {
        let slip = CommandRoutingSlip::from_uris(&uris(&[
            "kernel://local/js?tag=arrived",
            "kernel://local/js",
        ]))
        .unwrap();
        assert!(slip.starts_with(&uris(&["kernel://local/js?tag=arrived"])));
        assert!(!slip.starts_with(&uris(&["kernel://local/js"])));
        assert!(!slip.starts_with(&[]));
    }

    #[test]
    fn from_uris_rejects_duplicates() {
        assert!(EventRoutingSlip::from_uris(&uris(&["kernel://a/", "kernel://a/"])).is_err());
    }
}
