//! ---
//! mlw_section: "02-messaging-data-model"
//! mlw_subsection: "module"
//! mlw_type: "source"
//! mlw_scope: "code"
//! mlw_description: "Message classification, extraction and result assembly."
//! mlw_version: "v0.0.0-prealpha"
//! mlw_owner: "tbd"
//! ---
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{MessagingError, Result};

/// Message delivered by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message arrived on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl InboundMessage {
    /// Build an inbound message from text.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Payload as text, replacing invalid UTF-8 sequences.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Callback invoked for every inbound message.
pub type MessageCallback = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Bus abstraction used by the reaction cycle.
pub trait Transport: Send + Sync {
    /// Open the connection.
    fn connect(&self) -> Result<()>;
    /// Subscribe to a topic.
    fn subscribe(&self, topic: &str, qos: u8) -> Result<()>;
    /// Publish a payload.
    fn publish(&self, topic: &str, payload: &str, qos: u8) -> Result<()>;
    /// Whether the connection is currently up.
    fn is_connected(&self) -> bool;
    /// Close the connection.
    fn disconnect(&self) -> Result<()>;
    /// Install the inbound message callback, replacing any previous one.
    fn set_on_message(&self, callback: MessageCallback);
    /// Human-readable transport name for logging.
    fn name(&self) -> &'static str;
}

/// Message recorded by [`InMemoryTransport::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Target topic.
    pub topic: String,
    /// Published payload.
    pub payload: String,
    /// Requested quality of service.
    pub qos: u8,
}

#[derive(Default)]
struct Inner {
    connected: AtomicBool,
    refuse_connect: AtomicBool,
    subscriptions: Mutex<Vec<(String, u8)>>,
    rejected_topics: Mutex<HashSet<String>>,
    published: Mutex<VecDeque<PublishedMessage>>,
    callback: Mutex<Option<MessageCallback>>,
}

/// In-process transport that records traffic, for tests and local runs.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl InMemoryTransport {
    /// Create a disconnected transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Force the connection flag.
    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::SeqCst);
    }

    /// Make subsequent `connect` calls fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Make subscriptions to `topic` fail.
    pub fn reject_subscription(&self, topic: impl Into<String>) {
        self.inner.rejected_topics.lock().insert(topic.into());
    }

    /// Subscriptions made so far.
    pub fn subscriptions(&self) -> Vec<(String, u8)> {
        self.inner.subscriptions.lock().clone()
    }

    /// Messages published so far.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.published.lock().iter().cloned().collect()
    }

    /// Messages published to `topic`.
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    /// Drain the published messages.
    pub fn take_published(&self) -> Vec<PublishedMessage> {
        self.inner.published.lock().drain(..).collect()
    }

    /// Deliver a message to the installed callback. Returns `false` when no
    /// callback is installed.
    pub fn inject(&self, topic: &str, payload: &str) -> bool {
        let callback = self.inner.callback.lock().clone();
        match callback {
            Some(callback) => {
                callback(InboundMessage::new(topic, payload));
                true
            }
            None => false,
        }
    }
}

impl Transport for InMemoryTransport {
    fn connect(&self) -> Result<()> {
        if self.inner.refuse_connect.load(Ordering::SeqCst) {
            return Err(MessagingError::Transport("connection refused".into()));
        }
        self.set_connected(true);
        Ok(())
    }

    fn subscribe(&self, topic: &str, qos: u8) -> Result<()> {
        if self.inner.rejected_topics.lock().contains(topic) {
            return Err(MessagingError::Transport(format!(
                "subscription to '{}' rejected",
                topic
            )));
        }
        self.inner.subscriptions.lock().push((topic.to_owned(), qos));
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &str, qos: u8) -> Result<()> {
        if !self.is_connected() {
            return Err(MessagingError::Transport("not connected".into()));
        }
        self.inner.published.lock().push_back(PublishedMessage {
            topic: topic.to_owned(),
            payload: payload.to_owned(),
            qos,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn disconnect(&self) -> Result<()> {
        self.set_connected(false);
        Ok(())
    }

    fn set_on_message(&self, callback: MessageCallback) {
        *self.inner.callback.lock() = Some(callback);
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
