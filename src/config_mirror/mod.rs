//! Runtime configuration mirrored from the telemetry bus
//!
//! ## Responsibilities
//!
//! - Bind subscribers for every `config/*` key once, at construction.
//! - Produce one immutable [`ConfigSnapshot`] per tick; consumers never
//!   read the bus directly.
//! - Tolerate malformed operator input: a bad array length or unparseable
//!   tag layout falls back to the default instead of failing the tick.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::geometry::{pose_from_euler, Iso3};
use crate::telemetry::{Subscriber, TelemetryBus};

/// One tag's placement in the field frame, as listed in the `tagLayout`
/// JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagLayoutEntry {
    pub id: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub rx: f64,
    pub ry: f64,
    pub rz: f64,
}

impl TagLayoutEntry {
    /// Field-frame pose of the tag centre.
    pub fn pose(&self) -> Iso3 {
        pose_from_euler(self.x, self.y, self.z, self.rx, self.ry, self.rz)
    }
}

/// Atomic view of the runtime configuration for one tick.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub device_path: String,
    pub width: i64,
    pub height: i64,
    pub auto_exposure: i64,
    pub absolute_exposure: i64,
    pub gain: i64,
    pub camera_position: [f64; 6],
    pub error_ambiguity: f64,
    pub tag_size: f64,
    pub tag_family: String,
    pub tag_layout: Vec<TagLayoutEntry>,
    pub debug_tag: i64,
    pub field_size: [f64; 3],
    pub field_margin: [f64; 3],
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            device_path: "/dev/video0".to_string(),
            width: 1600,
            height: 1200,
            auto_exposure: 1,
            absolute_exposure: 10,
            gain: 25,
            camera_position: [0.0; 6],
            error_ambiguity: 0.15,
            tag_size: 0.1524,
            tag_family: "16h5".to_string(),
            tag_layout: Vec::new(),
            debug_tag: 9,
            field_size: [16.5417, 8.0136, 0.0],
            field_margin: [0.5, 0.5, 0.75],
        }
    }
}

impl ConfigSnapshot {
    /// Camera mount offset on the robot, from the `cameraPosition` 6-tuple
    /// (translation x/y/z then roll/pitch/yaw).
    pub fn mount_pose(&self) -> Iso3 {
        let p = &self.camera_position;
        pose_from_euler(p[0], p[1], p[2], p[3], p[4], p[5])
    }

    pub fn layout_pose(&self, id: i64) -> Option<Iso3> {
        self.tag_layout
            .iter()
            .find(|entry| entry.id == id)
            .map(TagLayoutEntry::pose)
    }
}

/// Fixed-length array field. Conversion happens only when the raw value
/// changes, so a malformed array warns once rather than every tick.
struct ArrayField<const N: usize> {
    key: &'static str,
    subscriber: Subscriber<Vec<f64>>,
    default: [f64; N],
    last: Option<(Vec<f64>, [f64; N])>,
}

impl<const N: usize> ArrayField<N> {
    fn new(bus: &Arc<TelemetryBus>, key: &'static str, default: [f64; N]) -> Self {
        Self {
            key,
            subscriber: bus.subscriber(key, default.to_vec()),
            default,
            last: None,
        }
    }

    fn get(&mut self) -> [f64; N] {
        let raw = self.subscriber.get();
        if let Some((last_raw, converted)) = &self.last {
            if *last_raw == raw {
                return *converted;
            }
        }
        let converted = match <[f64; N]>::try_from(raw.clone()) {
            Ok(array) => array,
            Err(bad) => {
                warn!(
                    key = self.key,
                    expected = N,
                    got = bad.len(),
                    "unexpected array length, using default"
                );
                self.default
            }
        };
        self.last = Some((raw, converted));
        converted
    }
}

/// Tag layout field. The JSON string is re-parsed only when it changes.
struct LayoutField {
    subscriber: Subscriber<String>,
    last: Option<(String, Vec<TagLayoutEntry>)>,
}

impl LayoutField {
    fn new(bus: &Arc<TelemetryBus>) -> Self {
        Self {
            subscriber: bus.subscriber("config/tagLayout", "[]".to_string()),
            last: None,
        }
    }

    fn get(&mut self) -> Vec<TagLayoutEntry> {
        let raw = self.subscriber.get();
        if let Some((last_raw, parsed)) = &self.last {
            if *last_raw == raw {
                return parsed.clone();
            }
        }
        let parsed = match serde_json::from_str::<Vec<TagLayoutEntry>>(&raw) {
            Ok(entries) => dedup_by_id(entries),
            Err(e) => {
                warn!(error = %e, "tag layout is not valid JSON, using empty layout");
                Vec::new()
            }
        };
        self.last = Some((raw, parsed.clone()));
        parsed
    }
}

/// Keeps the first entry per id. Re-parse happens only when the raw
/// string changes, so a duplicated id warns once, not every tick.
fn dedup_by_id(entries: Vec<TagLayoutEntry>) -> Vec<TagLayoutEntry> {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(entries.len());
    for entry in entries {
        if seen.insert(entry.id) {
            kept.push(entry);
        } else {
            warn!(id = entry.id, "duplicate tag id in layout, keeping the first entry");
        }
    }
    kept
}

/// Holds the eager `config/*` subscriptions and assembles snapshots.
pub struct ConfigMirror {
    device_path: Subscriber<String>,
    width: Subscriber<i64>,
    height: Subscriber<i64>,
    auto_exposure: Subscriber<i64>,
    absolute_exposure: Subscriber<i64>,
    gain: Subscriber<i64>,
    camera_position: ArrayField<6>,
    error_ambiguity: Subscriber<f64>,
    tag_size: Subscriber<f64>,
    tag_family: Subscriber<String>,
    tag_layout: LayoutField,
    debug_tag: Subscriber<i64>,
    field_size: ArrayField<3>,
    field_margin: ArrayField<3>,
}

impl ConfigMirror {
    pub fn new(bus: &Arc<TelemetryBus>) -> Self {
        let defaults = ConfigSnapshot::default();
        Self {
            device_path: bus.subscriber("config/devicePath", defaults.device_path),
            width: bus.subscriber("config/width", defaults.width),
            height: bus.subscriber("config/height", defaults.height),
            auto_exposure: bus.subscriber("config/autoExposure", defaults.auto_exposure),
            absolute_exposure: bus.subscriber("config/absoluteExposure", defaults.absolute_exposure),
            gain: bus.subscriber("config/gain", defaults.gain),
            camera_position: ArrayField::new(bus, "config/cameraPosition", defaults.camera_position),
            error_ambiguity: bus.subscriber("config/errorAmbiguity", defaults.error_ambiguity),
            tag_size: bus.subscriber("config/tagSize", defaults.tag_size),
            tag_family: bus.subscriber("config/tagFamily", defaults.tag_family),
            tag_layout: LayoutField::new(bus),
            debug_tag: bus.subscriber("config/debugTag", defaults.debug_tag),
            field_size: ArrayField::new(bus, "config/fieldSize", defaults.field_size),
            field_margin: ArrayField::new(bus, "config/fieldMargin", defaults.field_margin),
        }
    }

    pub fn snapshot(&mut self) -> ConfigSnapshot {
        ConfigSnapshot {
            device_path: self.device_path.get(),
            width: self.width.get(),
            height: self.height.get(),
            auto_exposure: self.auto_exposure.get(),
            absolute_exposure: self.absolute_exposure.get(),
            gain: self.gain.get(),
            camera_position: self.camera_position.get(),
            error_ambiguity: self.error_ambiguity.get(),
            tag_size: self.tag_size.get(),
            tag_family: self.tag_family.get(),
            tag_layout: self.tag_layout.get(),
            debug_tag: self.debug_tag.get(),
            field_size: self.field_size.get(),
            field_margin: self.field_margin.get(),
        }
    }
}
