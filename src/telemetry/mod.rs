//! TelemetryBus - Key-Value Pub/Sub State
//!
//! ## Responsibilities
//!
//! - Latest-value store for hierarchical telemetry topics
//! - Typed publish/subscribe handles bound to fixed topic paths
//! - Non-blocking reads so the frame loop never waits on a publisher
//!
//! Topics live under a root derived from the device name, e.g.
//! `/tagsight-left/config/tagSize`. A read returns the most recently
//! published value for the topic and may be stale; subscribers fall back
//! to their bound default until the first publish.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

/// Topic value variants
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    FloatArray(Vec<f64>),
}

/// A published value with its publish timestamp
#[derive(Debug, Clone)]
pub struct TelemetryEntry {
    pub value: TelemetryValue,
    /// Microseconds since the Unix epoch
    pub timestamp_micros: i64,
}

/// Conversion between Rust values and topic values
pub trait TopicValue: Sized {
    fn into_value(self) -> TelemetryValue;
    fn from_value(value: &TelemetryValue) -> Option<Self>;
}

impl TopicValue for bool {
    fn into_value(self) -> TelemetryValue {
        TelemetryValue::Bool(self)
    }

    fn from_value(value: &TelemetryValue) -> Option<Self> {
        match value {
            TelemetryValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl TopicValue for i64 {
    fn into_value(self) -> TelemetryValue {
        TelemetryValue::Int(self)
    }

    fn from_value(value: &TelemetryValue) -> Option<Self> {
        match value {
            TelemetryValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl TopicValue for f64 {
    fn into_value(self) -> TelemetryValue {
        TelemetryValue::Float(self)
    }

    // Integer topics are readable as floats so numeric config fields
    // tolerate either publisher type.
    fn from_value(value: &TelemetryValue) -> Option<Self> {
        match value {
            TelemetryValue::Float(f) => Some(*f),
            TelemetryValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl TopicValue for String {
    fn into_value(self) -> TelemetryValue {
        TelemetryValue::Text(self)
    }

    fn from_value(value: &TelemetryValue) -> Option<Self> {
        match value {
            TelemetryValue::Text(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl TopicValue for Vec<f64> {
    fn into_value(self) -> TelemetryValue {
        TelemetryValue::FloatArray(self)
    }

    fn from_value(value: &TelemetryValue) -> Option<Self> {
        match value {
            TelemetryValue::FloatArray(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// TelemetryBus instance
pub struct TelemetryBus {
    root: String,
    entries: RwLock<HashMap<String, TelemetryEntry>>,
}

impl TelemetryBus {
    /// Create a bus rooted at `/tagsight-<device_name>`
    pub fn new(device_name: &str) -> Self {
        Self {
            root: format!("/tagsight-{}", device_name),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Namespace root all topics live under
    pub fn root(&self) -> &str {
        &self.root
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}/{}", self.root, key)
    }

    /// Publish a value under the bus root with the current wall-clock timestamp
    pub fn publish(&self, key: &str, value: TelemetryValue) {
        self.publish_at(key, value, chrono::Utc::now().timestamp_micros());
    }

    /// Publish a value with an explicit timestamp
    pub fn publish_at(&self, key: &str, value: TelemetryValue, timestamp_micros: i64) {
        let full = self.full_key(key);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            full,
            TelemetryEntry {
                value,
                timestamp_micros,
            },
        );
    }

    /// Latest published entry for a topic, if any
    pub fn latest(&self, key: &str) -> Option<TelemetryEntry> {
        let full = self.full_key(key);
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(&full).cloned()
    }

    /// Create a typed subscriber bound to a topic with a default value
    pub fn subscriber<T: TopicValue>(self: &Arc<Self>, key: &str, default: T) -> Subscriber<T> {
        Subscriber {
            bus: Arc::clone(self),
            key: key.to_string(),
            default,
        }
    }

    /// Create a typed publisher bound to a topic
    pub fn publisher<T: TopicValue>(self: &Arc<Self>, key: &str) -> Publisher<T> {
        Publisher {
            bus: Arc::clone(self),
            key: key.to_string(),
            _marker: PhantomData,
        }
    }
}

/// Read handle for one topic; falls back to its default until a value arrives
pub struct Subscriber<T: TopicValue> {
    bus: Arc<TelemetryBus>,
    key: String,
    default: T,
}

impl<T: TopicValue + Clone> Subscriber<T> {
    /// Latest value for the topic, or the bound default
    pub fn get(&self) -> T {
        self.bus
            .latest(&self.key)
            .and_then(|entry| T::from_value(&entry.value))
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Write handle for one topic
pub struct Publisher<T: TopicValue> {
    bus: Arc<TelemetryBus>,
    key: String,
    _marker: PhantomData<T>,
}

impl<T: TopicValue> Publisher<T> {
    /// Publish with the current wall-clock timestamp
    pub fn set(&self, value: T) {
        self.bus.publish(&self.key, value.into_value());
    }

    /// Publish with an explicit timestamp
    pub fn set_at(&self, value: T, timestamp_micros: i64) {
        self.bus
            .publish_at(&self.key, value.into_value(), timestamp_micros);
    }
}
