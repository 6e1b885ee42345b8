//! # Event
//!
//! Events are emitted to a tenant's event stream after each committed
//! message. Subscribers receive the events matching their filter; a
//! subscriber that falls behind its bounded queue has the oldest
//! notifications dropped and is told how many it missed.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;

use crate::records::RecordsFilter;
use crate::store::{Entry, EntryType};

/// Alias for `store::Entry` used for event-related functionality.
pub type Event = Entry;

/// Per-subscription queue depth. When a subscriber lags further than this,
/// the oldest notifications are dropped and a [`Notification::Lagged`] is
/// delivered in their place.
pub const QUEUE_DEPTH: usize = 256;

/// Filter applied to events before delivery to a subscriber.
pub type SubscribeFilter = RecordsFilter;

/// A single item delivered to a subscriber.
#[derive(Clone, Debug)]
pub enum Notification {
    /// A committed event matching the subscription's filter.
    Event(Event),

    /// The subscriber lagged and `n` notifications were dropped.
    Lagged(u64),
}

/// A handle to a tenant event subscription: a stream of notifications plus
/// an identifier. Dropping the subscriber detaches the filter and closes
/// the channel.
pub struct Subscriber {
    /// The subscription's unique identifier.
    pub id: String,

    inner: Pin<Box<dyn Stream<Item = Notification> + Send>>,
}

impl Subscriber {
    /// Wrap a provider's subscription stream for surfacing to users.
    #[must_use]
    pub fn new(stream: Pin<Box<dyn Stream<Item = Notification> + Send>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            inner: stream,
        }
    }
}

impl Default for Subscriber {
    fn default() -> Self {
        Self::new(Box::pin(futures::stream::empty()))
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).finish()
    }
}

impl Stream for Subscriber {
    type Item = Notification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl RecordsFilter {
    /// Check the event matches the filter. Only `RecordsWrite` events are
    /// candidates: deletes and configuration changes do not notify record
    /// subscribers.
    #[must_use]
    pub fn is_match(&self, event: &Event) -> bool {
        let EntryType::Write(write) = &event.message else {
            return false;
        };
        let descriptor = &write.descriptor;

        if let Some(record_id) = &self.record_id {
            if record_id != &write.record_id {
                return false;
            }
        }
        if let Some(author) = &self.author {
            if !author.to_vec().contains(&write.authorization.author().unwrap_or_default()) {
                return false;
            }
        }
        if let Some(attester) = &self.attester {
            if write.attester().as_ref() != Some(attester) {
                return false;
            }
        }
        if let Some(recipient) = &self.recipient {
            if !recipient.to_vec().contains(descriptor.recipient.as_ref().unwrap_or(&String::new()))
            {
                return false;
            }
        }
        if let Some(protocol) = &self.protocol {
            if Some(protocol) != descriptor.protocol.as_ref() {
                return false;
            }
        }
        if let Some(protocol_path) = &self.protocol_path {
            if Some(protocol_path) != descriptor.protocol_path.as_ref() {
                return false;
            }
        }
        if let Some(context_id) = &self.context_id {
            if Some(context_id) != write.context_id.as_ref() {
                return false;
            }
        }
        if let Some(parent_id) = &self.parent_id {
            if Some(parent_id) != descriptor.parent_id.as_ref() {
                return false;
            }
        }
        if let Some(schema) = &self.schema {
            if Some(schema) != descriptor.schema.as_ref() {
                return false;
            }
        }
        if let Some(published) = &self.published {
            if Some(published) != descriptor.published.as_ref() {
                return false;
            }
        }
        if let Some(data_format) = &self.data_format {
            if data_format != &descriptor.data_format {
                return false;
            }
        }
        if let Some(data_cid) = &self.data_cid {
            if data_cid != &descriptor.data_cid {
                return false;
            }
        }
        if let Some(data_size) = &self.data_size {
            if !data_size.contains(&descriptor.data_size) {
                return false;
            }
        }
        if let Some(date_created) = &self.date_created {
            if !date_created.contains(&descriptor.date_created) {
                return false;
            }
        }
        if let Some(date_published) = &self.date_published {
            let Some(published) = descriptor.date_published.as_ref() else {
                return false;
            };
            if !date_published.contains(published) {
                return false;
            }
        }

        true
    }
}
