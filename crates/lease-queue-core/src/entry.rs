//! Entry types for queue operations including core domain identifiers.
//!
//! An [`Entry`] is the authoritative record of one unit of work. It is only ever
//! changed by applying a [`Transition`] whose [`Expectation`] matched the current
//! record; see [`crate::store::MessageStore::compare_and_transition`].

use crate::error::ValidationError;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use ulid::Ulid;
use uuid::Uuid;

#[cfg(test)]
#[path = "entry_tests.rs"]
mod tests;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Unique identifier for queue entries
///
/// Uses ULID so that ids sort in creation order; the store relies on this as the
/// tie-breaker between entries enqueued at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(Ulid);

impl EntryId {
    /// Generate a new random entry ID
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Wrap an already generated ULID
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Get underlying ULID
    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "entry_id".to_string(),
            });
        }

        let ulid = s
            .parse::<Ulid>()
            .map_err(|e| ValidationError::InvalidFormat {
                field: "entry_id".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self(ulid))
    }
}

/// Opaque token identifying the current holder of a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    /// Generate a fresh random lease token
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LeaseToken {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s).map_err(|e| ValidationError::InvalidFormat {
            field: "lease_token".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self(uuid))
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current wall-clock time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Timestamp `duration` later, saturating at the largest representable time
    pub fn add(&self, duration: Duration) -> Self {
        Self(
            self.0
                .checked_add_signed(duration)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }

    /// Time elapsed from `earlier` to `self` (negative if `earlier` is later)
    pub fn since(&self, earlier: &Timestamp) -> Duration {
        self.0.signed_duration_since(earlier.0)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Entry State Machine
// ============================================================================

/// Lifecycle state of an entry
///
/// `Visible -> Leased -> {Deleted | Visible | Quarantined}`. `Deleted` is
/// terminal; `Quarantined` only exits through operator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Visible,
    Leased,
    Quarantined,
    Deleted,
}

impl EntryState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Deleted)
    }
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Visible => "Visible",
            Self::Leased => "Leased",
            Self::Quarantined => "Quarantined",
            Self::Deleted => "Deleted",
        };
        f.write_str(name)
    }
}

impl FromStr for EntryState {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "visible" => Ok(Self::Visible),
            "leased" => Ok(Self::Leased),
            "quarantined" => Ok(Self::Quarantined),
            "deleted" => Ok(Self::Deleted),
            _ => Err(ValidationError::InvalidFormat {
                field: "entry_state".to_string(),
                message: format!("unknown state '{}'", s),
            }),
        }
    }
}

// ============================================================================
// Entry Record
// ============================================================================

/// The current lease on an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub token: LeaseToken,
    pub expires_at: Timestamp,
}

impl Lease {
    /// Check if the lease has run out at `now`
    pub fn is_expired(&self, now: &Timestamp) -> bool {
        *now >= self.expires_at
    }
}

/// Authoritative record of a unit of work
///
/// This is also the persisted layout: one serialized `Entry` per record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    id: EntryId,
    #[serde(with = "bytes_serde")]
    payload: Bytes,
    state: EntryState,
    enqueued_at: Timestamp,
    delivery_count: u32,
    lease_token: Option<LeaseToken>,
    lease_expires_at: Option<Timestamp>,
    visible_after: Timestamp,
}

/// Custom serialization for Bytes
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

impl Entry {
    /// Create a freshly enqueued entry
    pub fn new(id: EntryId, payload: Bytes, enqueued_at: Timestamp) -> Self {
        Self {
            id,
            payload,
            state: EntryState::Visible,
            enqueued_at,
            delivery_count: 0,
            lease_token: None,
            lease_expires_at: None,
            visible_after: enqueued_at,
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn enqueued_at(&self) -> Timestamp {
        self.enqueued_at
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn lease_token(&self) -> Option<LeaseToken> {
        self.lease_token
    }

    pub fn lease_expires_at(&self) -> Option<Timestamp> {
        self.lease_expires_at
    }

    pub fn visible_after(&self) -> Timestamp {
        self.visible_after
    }

    /// Current lease, if the entry is leased
    pub fn lease(&self) -> Option<Lease> {
        match (self.state, self.lease_token, self.lease_expires_at) {
            (EntryState::Leased, Some(token), Some(expires_at)) => {
                Some(Lease { token, expires_at })
            }
            _ => None,
        }
    }

    /// Check if the entry can be handed to a consumer at `now`
    pub fn is_available(&self, now: &Timestamp) -> bool {
        self.state == EntryState::Visible && self.visible_after <= *now
    }

    /// Check if the entry holds a lease that ran out at or before `now`
    pub fn has_expired_lease(&self, now: &Timestamp) -> bool {
        self.lease().is_some_and(|lease| lease.is_expired(now))
    }

    /// Produce the record that results from applying `transition`
    ///
    /// Only lease fields, visibility and the delivery count change; id, payload
    /// and enqueue time are carried over untouched.
    pub fn apply(&self, transition: &Transition) -> Entry {
        let mut next = self.clone();
        next.state = transition.target;

        match transition.lease {
            Some(lease) => {
                next.lease_token = Some(lease.token);
                next.lease_expires_at = Some(lease.expires_at);
            }
            None => {
                next.lease_token = None;
                next.lease_expires_at = None;
            }
        }

        if let Some(visible_after) = transition.visible_after {
            next.visible_after = visible_after;
        }

        if transition.counts_delivery {
            next.delivery_count = next.delivery_count.saturating_add(1);
        }

        next
    }
}

// ============================================================================
// Conditional Update Primitives
// ============================================================================

/// What the caller believes the entry currently looks like
///
/// The token comparison is exact: `None` only matches an entry without a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expectation {
    pub state: EntryState,
    pub lease_token: Option<LeaseToken>,
    /// When set, the entry's backoff must have elapsed by this time
    pub visible_by: Option<Timestamp>,
}

impl Expectation {
    pub fn visible() -> Self {
        Self {
            state: EntryState::Visible,
            lease_token: None,
            visible_by: None,
        }
    }

    /// `Visible` and fetchable at `now`
    pub fn available(now: Timestamp) -> Self {
        Self {
            visible_by: Some(now),
            ..Self::visible()
        }
    }

    pub fn leased(token: LeaseToken) -> Self {
        Self {
            state: EntryState::Leased,
            lease_token: Some(token),
            visible_by: None,
        }
    }

    pub fn quarantined() -> Self {
        Self {
            state: EntryState::Quarantined,
            lease_token: None,
            visible_by: None,
        }
    }

    /// Check if `entry` is in the expected state and held by the expected token
    pub fn matches(&self, entry: &Entry) -> bool {
        entry.state == self.state
            && entry.lease_token == self.lease_token
            && self
                .visible_by
                .map_or(true, |deadline| entry.visible_after <= deadline)
    }
}

/// A state change to apply to an entry
///
/// Constructed only through the named constructors so that lease fields are
/// present exactly when the target state is `Leased`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    target: EntryState,
    lease: Option<Lease>,
    visible_after: Option<Timestamp>,
    counts_delivery: bool,
}

impl Transition {
    /// Hand the entry to a new lease holder
    pub fn grant(token: LeaseToken, expires_at: Timestamp) -> Self {
        Self {
            target: EntryState::Leased,
            lease: Some(Lease { token, expires_at }),
            visible_after: None,
            counts_delivery: true,
        }
    }

    /// Push out the expiry of an existing lease
    pub fn renew(token: LeaseToken, expires_at: Timestamp) -> Self {
        Self {
            target: EntryState::Leased,
            lease: Some(Lease { token, expires_at }),
            visible_after: None,
            counts_delivery: false,
        }
    }

    /// Make the entry fetchable again once `visible_after` has passed
    pub fn requeue(visible_after: Timestamp) -> Self {
        Self {
            target: EntryState::Visible,
            lease: None,
            visible_after: Some(visible_after),
            counts_delivery: false,
        }
    }

    pub fn quarantine() -> Self {
        Self {
            target: EntryState::Quarantined,
            lease: None,
            visible_after: None,
            counts_delivery: false,
        }
    }

    pub fn delete() -> Self {
        Self {
            target: EntryState::Deleted,
            lease: None,
            visible_after: None,
            counts_delivery: false,
        }
    }
}

// ============================================================================
// Consumer View
// ============================================================================

/// A leased entry as handed to a consumer by dequeue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub entry_id: EntryId,
    pub payload: Bytes,
    pub lease_token: LeaseToken,
    pub lease_expires_at: Timestamp,
    pub delivery_count: u32,
    pub enqueued_at: Timestamp,
}

impl Delivery {
    /// Build the consumer view of a leased entry
    ///
    /// Returns `None` when the entry does not currently hold a lease.
    pub fn from_entry(entry: &Entry) -> Option<Self> {
        let lease = entry.lease()?;
        Some(Self {
            entry_id: entry.id(),
            payload: entry.payload().clone(),
            lease_token: lease.token,
            lease_expires_at: lease.expires_at,
            delivery_count: entry.delivery_count(),
            enqueued_at: entry.enqueued_at(),
        })
    }

    /// Get payload as a UTF-8 string, if it is one
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
