//! # Decentralized Web Node (DWN)
//!
//! A per-tenant, message-oriented personal data store. Each tenant is
//! identified by a decentralized identifier (DID). Clients submit signed
//! messages that configure protocols, write records, query/read/delete
//! records, subscribe to events, and grant or revoke permissions. The node
//! validates, authorizes, stores, indexes, and (optionally) streams back
//! records and their binary payloads.
//!
//! Messages are dispatched through [`endpoint::handle`]. Storage, DID
//! resolution, and event transport are supplied by the caller through the
//! traits in [`provider`].

pub mod authorization;
pub mod cid;
pub mod data;
pub mod endpoint;
mod error;
pub mod event;
pub mod permissions;
pub mod protocols;
pub mod provider;
pub mod records;
mod schema;
pub mod store;
mod utils;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crate::endpoint::{Message, Reply, Status};
pub use crate::error::{Error, Result};

/// The message interface. Every descriptor carries an `(interface, method)`
/// pair identifying the operation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, derive_more::Display)]
pub enum Interface {
    /// Record create, update, read, query, subscribe, and delete operations.
    #[default]
    Records,

    /// Protocol installation and discovery.
    Protocols,

    /// Permission grants and revocations.
    Permissions,
}

/// The message method within an interface.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, derive_more::Display)]
pub enum Method {
    /// Create or update a record.
    #[default]
    Write,

    /// Read a single record.
    Read,

    /// Query for matching records.
    Query,

    /// Subscribe to record events.
    Subscribe,

    /// Delete (tombstone) a record.
    Delete,

    /// Install a protocol definition.
    Configure,

    /// Grant a permission.
    Grant,

    /// Revoke a permission grant.
    Revoke,
}

/// The common part of every message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// The associated web node interface.
    pub interface: Interface,

    /// The interface method.
    pub method: Method,

    /// The timestamp of the message, microsecond precision.
    #[serde(with = "utils::rfc3339_micros")]
    pub message_timestamp: DateTime<Utc>,
}

/// A value or a list of values. Used in filters where a property may match
/// one of several candidates.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// A single value.
    One(T),

    /// A set of values.
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    /// Convert to a `Vec` regardless of underlying representation.
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            Self::One(value) => vec![value.clone()],
            Self::Many(values) => values.clone(),
        }
    }
}

impl<T: Default> Default for OneOrMany<T> {
    fn default() -> Self {
        Self::One(T::default())
    }
}

/// An inclusive or exclusive lower bound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lower<T> {
    /// Matches values greater than or equal to the bound (`gte`).
    Inclusive(T),

    /// Matches values strictly greater than the bound (`gt`).
    Exclusive(T),
}

/// An inclusive or exclusive upper bound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Upper<T> {
    /// Matches values less than or equal to the bound (`lte`).
    Inclusive(T),

    /// Matches values strictly less than the bound (`lt`).
    Exclusive(T),
}

/// A half-open or closed range over an ordered type. Serialized to the wire
/// as a map of `gt`/`gte`/`lt`/`lte` entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Range<T> {
    /// The lower bound, if any.
    pub lower: Option<Lower<T>>,

    /// The upper bound, if any.
    pub upper: Option<Upper<T>>,
}

impl<T> Range<T> {
    /// Create an unbounded range.
    #[must_use]
    pub const fn new() -> Self {
        Self { lower: None, upper: None }
    }

    /// Set a strict lower bound.
    #[must_use]
    pub fn gt(mut self, gt: impl Into<T>) -> Self {
        self.lower = Some(Lower::Exclusive(gt.into()));
        self
    }

    /// Set an inclusive lower bound.
    #[must_use]
    pub fn ge(mut self, ge: impl Into<T>) -> Self {
        self.lower = Some(Lower::Inclusive(ge.into()));
        self
    }

    /// Set a strict upper bound.
    #[must_use]
    pub fn lt(mut self, lt: impl Into<T>) -> Self {
        self.upper = Some(Upper::Exclusive(lt.into()));
        self
    }

    /// Set an inclusive upper bound.
    #[must_use]
    pub fn le(mut self, le: impl Into<T>) -> Self {
        self.upper = Some(Upper::Inclusive(le.into()));
        self
    }

    /// Check whether `value` falls within the range.
    pub fn contains(&self, value: &T) -> bool
    where
        T: PartialOrd,
    {
        let lower_ok = match &self.lower {
            Some(Lower::Inclusive(lower)) => value >= lower,
            Some(Lower::Exclusive(lower)) => value > lower,
            None => true,
        };
        if !lower_ok {
            return false;
        }
        match &self.upper {
            Some(Upper::Inclusive(upper)) => value <= upper,
            Some(Upper::Exclusive(upper)) => value < upper,
            None => true,
        }
    }
}

impl<T: Serialize> Serialize for Range<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(None)?;
        match &self.lower {
            Some(Lower::Inclusive(value)) => map.serialize_entry("gte", value)?,
            Some(Lower::Exclusive(value)) => map.serialize_entry("gt", value)?,
            None => {}
        }
        match &self.upper {
            Some(Upper::Inclusive(value)) => map.serialize_entry("lte", value)?,
            Some(Upper::Exclusive(value)) => map.serialize_entry("lt", value)?,
            None => {}
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Range<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Bounds<T> {
            gt: Option<T>,
            gte: Option<T>,
            lt: Option<T>,
            lte: Option<T>,
        }

        let bounds = Bounds::deserialize(deserializer)?;
        let lower = match (bounds.gte, bounds.gt) {
            (Some(gte), _) => Some(Lower::Inclusive(gte)),
            (None, Some(gt)) => Some(Lower::Exclusive(gt)),
            (None, None) => None,
        };
        let upper = match (bounds.lte, bounds.lt) {
            (Some(lte), _) => Some(Upper::Inclusive(lte)),
            (None, Some(lt)) => Some(Upper::Exclusive(lt)),
            (None, None) => None,
        };

        Ok(Self { lower, upper })
    }
}

/// An inclusive range over message dates. Serialized as `from`/`to`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DateRange {
    /// The earliest matching date, inclusive.
    #[serde(rename = "from")]
    #[serde(with = "utils::rfc3339_micros_opt")]
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub lower: Option<DateTime<Utc>>,

    /// The latest matching date, inclusive.
    #[serde(rename = "to")]
    #[serde(with = "utils::rfc3339_micros_opt")]
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub upper: Option<DateTime<Utc>>,
}

impl DateRange {
    /// Create an unbounded date range.
    #[must_use]
    pub const fn new() -> Self {
        Self { lower: None, upper: None }
    }

    /// Set the earliest matching date.
    #[must_use]
    pub const fn from(mut self, from: DateTime<Utc>) -> Self {
        self.lower = Some(from);
        self
    }

    /// Set the latest matching date.
    #[must_use]
    pub const fn to(mut self, to: DateTime<Utc>) -> Self {
        self.upper = Some(to);
        self
    }

    /// Check whether `date` falls within the range.
    #[must_use]
    pub fn contains(&self, date: &DateTime<Utc>) -> bool {
        if let Some(lower) = &self.lower {
            if date < lower {
                return false;
            }
        }
        if let Some(upper) = &self.upper {
            if date > upper {
                return false;
            }
        }
        true
    }
}

pub(crate) fn interface_method(interface: &Interface, method: &Method) -> String {
    format!("{interface}-{method}").to_lowercase()
}
