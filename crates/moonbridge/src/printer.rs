//! Typed printer state, assembled from heterogeneous partial updates.
//!
//! Every subsystem record is a flat set of optional fields: nothing is
//! known until the first payload populates it, and a field absent from an
//! incoming patch is left untouched. That merge rule is what lets the
//! poll channel (full snapshots) and the push channel (field deltas) feed
//! the same state.
//!
//! Incoming fields are matched against an explicit allowlist per record;
//! unknown fields are ignored, never stored. The set of subsystems is
//! fixed when the state is constructed.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

fn take_f64(slot: &mut Option<f64>, value: &Value) {
    *slot = value.as_f64();
}

fn take_bool(slot: &mut Option<bool>, value: &Value) {
    *slot = value.as_bool();
}

fn take_string(slot: &mut Option<String>, value: &Value) {
    *slot = value.as_str().map(str::to_string);
}

fn take_f64_array(slot: &mut Option<Vec<f64>>, value: &Value) {
    *slot = value
        .as_array()
        .map(|items| items.iter().filter_map(Value::as_f64).collect());
}

/// Temperature-controlled element: the heated bed, or the thermal side of
/// an extruder.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Heater {
    pub temperature: Option<f64>,
    pub target: Option<f64>,
    pub power: Option<f64>,
}

impl Heater {
    fn merge(&mut self, fields: &Map<String, Value>) {
        for (name, value) in fields {
            match name.as_str() {
                "temperature" => take_f64(&mut self.temperature, value),
                "target" => take_f64(&mut self.target, value),
                "power" => take_f64(&mut self.power, value),
                _ => {}
            }
        }
    }
}

/// An extruder is a heater plus extrusion-specific fields; composition
/// rather than inheritance, since nothing dispatches polymorphically.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Extruder {
    pub heater: Heater,
    pub pressure_advance: Option<f64>,
    pub smooth_time: Option<f64>,
    pub can_extrude: Option<bool>,
}

impl Extruder {
    fn merge(&mut self, fields: &Map<String, Value>) {
        self.heater.merge(fields);
        for (name, value) in fields {
            match name.as_str() {
                "pressure_advance" => take_f64(&mut self.pressure_advance, value),
                "smooth_time" => take_f64(&mut self.smooth_time, value),
                "can_extrude" => take_bool(&mut self.can_extrude, value),
                _ => {}
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Toolhead {
    pub position: Option<Vec<f64>>,
    pub homed_axes: Option<String>,
    pub max_velocity: Option<f64>,
    pub max_accel: Option<f64>,
    pub max_accel_to_decel: Option<f64>,
    pub square_corner_velocity: Option<f64>,
    /// Name of the currently active extruder object
    pub extruder: Option<String>,
}

impl Toolhead {
    fn merge(&mut self, fields: &Map<String, Value>) {
        for (name, value) in fields {
            match name.as_str() {
                "position" => take_f64_array(&mut self.position, value),
                "homed_axes" => take_string(&mut self.homed_axes, value),
                "max_velocity" => take_f64(&mut self.max_velocity, value),
                "max_accel" => take_f64(&mut self.max_accel, value),
                "max_accel_to_decel" => take_f64(&mut self.max_accel_to_decel, value),
                "square_corner_velocity" => take_f64(&mut self.square_corner_velocity, value),
                "extruder" => take_string(&mut self.extruder, value),
                _ => {}
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Fan {
    /// Fraction 0..1 as received on the wire; the accessor layer scales
    /// it to a percentage for display.
    pub speed: Option<f64>,
    pub rpm: Option<f64>,
}

impl Fan {
    fn merge(&mut self, fields: &Map<String, Value>) {
        for (name, value) in fields {
            match name.as_str() {
                "speed" => take_f64(&mut self.speed, value),
                "rpm" => take_f64(&mut self.rpm, value),
                _ => {}
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DisplayStatus {
    pub progress: Option<f64>,
    pub message: Option<String>,
}

impl DisplayStatus {
    fn merge(&mut self, fields: &Map<String, Value>) {
        for (name, value) in fields {
            match name.as_str() {
                "progress" => take_f64(&mut self.progress, value),
                "message" => take_string(&mut self.message, value),
                _ => {}
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrintStats {
    pub state: Option<String>,
    pub filename: Option<String>,
    pub total_duration: Option<f64>,
    pub print_duration: Option<f64>,
    pub filament_used: Option<f64>,
}

impl PrintStats {
    fn merge(&mut self, fields: &Map<String, Value>) {
        for (name, value) in fields {
            match name.as_str() {
                "state" => take_string(&mut self.state, value),
                "filename" => take_string(&mut self.filename, value),
                "total_duration" => take_f64(&mut self.total_duration, value),
                "print_duration" => take_f64(&mut self.print_duration, value),
                "filament_used" => take_f64(&mut self.filament_used, value),
                _ => {}
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Webhooks {
    pub state: Option<String>,
    pub state_message: Option<String>,
}

impl Webhooks {
    fn merge(&mut self, fields: &Map<String, Value>) {
        for (name, value) in fields {
            match name.as_str() {
                "state" => take_string(&mut self.state, value),
                "state_message" => take_string(&mut self.state_message, value),
                _ => {}
            }
        }
    }
}

/// Reachability and identity of the backing firmware service, populated
/// from `/server/info`. Gates the bulk status query: there is no point
/// asking for subsystem data while Klippy is not connected.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KlippyStatus {
    pub klippy_connected: Option<bool>,
    pub klippy_state: Option<String>,
    pub moonraker_version: Option<String>,
}

impl KlippyStatus {
    pub fn update(&mut self, info: &Map<String, Value>) {
        for (name, value) in info {
            match name.as_str() {
                "klippy_connected" => take_bool(&mut self.klippy_connected, value),
                "klippy_state" => take_string(&mut self.klippy_state, value),
                "moonraker_version" => take_string(&mut self.moonraker_version, value),
                _ => {}
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.klippy_connected == Some(true)
    }
}

/// Last sample of the service's own process telemetry, delivered via
/// `notify_proc_stat_update`. Kept outside [`PrinterState`]; it describes
/// the service host, not the printer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcStats {
    pub cpu_temp: Option<f64>,
    pub cpu_usage: Option<f64>,
    pub memory_kb: Option<f64>,
    pub websocket_connections: Option<f64>,
}

impl ProcStats {
    pub fn update(&mut self, params: &[Value]) {
        for entry in params {
            let Some(fields) = entry.as_object() else {
                continue;
            };
            if let Some(value) = fields.get("cpu_temp") {
                take_f64(&mut self.cpu_temp, value);
            }
            if let Some(value) = fields.get("websocket_connections") {
                take_f64(&mut self.websocket_connections, value);
            }
            if let Some(stats) = fields.get("moonraker_stats").and_then(Value::as_object) {
                if let Some(value) = stats.get("cpu_usage") {
                    take_f64(&mut self.cpu_usage, value);
                }
                if let Some(value) = stats.get("memory") {
                    take_f64(&mut self.memory_kb, value);
                }
            }
        }
    }
}

/// Device-registry metadata for the host framework.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub manufacturer: &'static str,
    pub sw_version: Option<String>,
}

/// The root aggregate: one instance per configured printer, mutated in
/// place for the device's entire lifetime.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrinterState {
    id: String,
    name: String,
    pub klippy: KlippyStatus,
    pub toolhead: Toolhead,
    extruders: BTreeMap<String, Extruder>,
    pub heater_bed: Heater,
    pub fan: Fan,
    pub display_status: DisplayStatus,
    pub print_stats: PrintStats,
    pub webhooks: Webhooks,
}

impl PrinterState {
    /// The subsystem set is fixed here; merges can only update fields
    /// within these records.
    pub fn new(id: String, name: String, extruder_names: &[String]) -> Self {
        Self {
            id,
            name,
            klippy: KlippyStatus::default(),
            toolhead: Toolhead::default(),
            extruders: extruder_names
                .iter()
                .map(|n| (n.clone(), Extruder::default()))
                .collect(),
            heater_bed: Heater::default(),
            fan: Fan::default(),
            display_status: DisplayStatus::default(),
            print_stats: PrintStats::default(),
            webhooks: Webhooks::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn extruder(&self, name: &str) -> Option<&Extruder> {
        self.extruders.get(name)
    }

    /// Subsystem names for the query and subscribe requests, in the order
    /// the original integration lists them.
    pub fn subsystem_names(&self) -> Vec<String> {
        let mut names = vec![
            "display_status".to_string(),
            "heater_bed".to_string(),
            "toolhead".to_string(),
        ];
        names.extend(self.extruders.keys().cloned());
        names.push("print_stats".to_string());
        names.push("webhooks".to_string());
        names.push("fan".to_string());
        names
    }

    /// Merge a full snapshot: every subsystem present in the map has its
    /// present fields replaced; subsystems absent from the map are left
    /// untouched.
    pub fn apply_snapshot(&mut self, status: &Map<String, Value>) {
        for (name, fields) in status {
            self.merge_subsystem(name, fields);
        }
    }

    /// Merge a push delta. Entries that are not objects (the trailing
    /// event timestamp in `notify_status_update` params) are skipped.
    pub fn apply_delta(&mut self, params: &[Value]) {
        for entry in params {
            match entry.as_object() {
                Some(map) => {
                    for (name, fields) in map {
                        self.merge_subsystem(name, fields);
                    }
                }
                None => debug!("skipping non-object delta entry: {}", entry),
            }
        }
    }

    fn merge_subsystem(&mut self, name: &str, fields: &Value) {
        let Some(fields) = fields.as_object() else {
            warn!("subsystem `{}` payload is not an object, ignoring", name);
            return;
        };
        match name {
            "toolhead" => self.toolhead.merge(fields),
            "heater_bed" => self.heater_bed.merge(fields),
            "fan" => self.fan.merge(fields),
            "display_status" => self.display_status.merge(fields),
            "print_stats" => self.print_stats.merge(fields),
            "webhooks" => self.webhooks.merge(fields),
            other => match self.extruders.get_mut(other) {
                Some(extruder) => extruder.merge(fields),
                // Unknown firmware plugins must not break established
                // subsystems.
                None => warn!("ignoring unknown subsystem `{}`", other),
            },
        }
    }

    /// Uniform read path for externally configured observers. Unknown
    /// subsystem or field names yield `None`, never an error.
    ///
    /// Fan speed and extruder power are fractions on the wire and scaled
    /// to percentages here; everything else is returned as stored.
    pub fn value_of(&self, subsystem: &str, field: &str) -> Option<Value> {
        match subsystem {
            "klippy" => match field {
                "klippy_connected" => self.klippy.klippy_connected.map(Value::from),
                "klippy_state" => self.klippy.klippy_state.clone().map(Value::from),
                "moonraker_version" => self.klippy.moonraker_version.clone().map(Value::from),
                _ => None,
            },
            "toolhead" => match field {
                "position" => self.toolhead.position.clone().map(|p| json!(p)),
                "homed_axes" => self.toolhead.homed_axes.clone().map(Value::from),
                "max_velocity" => self.toolhead.max_velocity.map(Value::from),
                "max_accel" => self.toolhead.max_accel.map(Value::from),
                "max_accel_to_decel" => self.toolhead.max_accel_to_decel.map(Value::from),
                "square_corner_velocity" => {
                    self.toolhead.square_corner_velocity.map(Value::from)
                }
                "extruder" => self.toolhead.extruder.clone().map(Value::from),
                _ => None,
            },
            "heater_bed" => Self::heater_value(&self.heater_bed, field, false),
            "fan" => match field {
                "speed" => self.fan.speed.map(|s| Value::from(s * 100.0)),
                "rpm" => self.fan.rpm.map(Value::from),
                _ => None,
            },
            "display_status" => match field {
                "progress" => self.display_status.progress.map(Value::from),
                "message" => self.display_status.message.clone().map(Value::from),
                _ => None,
            },
            "print_stats" => match field {
                "state" => self.print_stats.state.clone().map(Value::from),
                "filename" => self.print_stats.filename.clone().map(Value::from),
                "total_duration" => self.print_stats.total_duration.map(Value::from),
                "print_duration" => self.print_stats.print_duration.map(Value::from),
                "filament_used" => self.print_stats.filament_used.map(Value::from),
                _ => None,
            },
            "webhooks" => match field {
                "state" => self.webhooks.state.clone().map(Value::from),
                "state_message" => self.webhooks.state_message.clone().map(Value::from),
                _ => None,
            },
            other => {
                let extruder = self.extruders.get(other)?;
                match field {
                    "pressure_advance" => extruder.pressure_advance.map(Value::from),
                    "smooth_time" => extruder.smooth_time.map(Value::from),
                    "can_extrude" => extruder.can_extrude.map(Value::from),
                    _ => Self::heater_value(&extruder.heater, field, true),
                }
            }
        }
    }

    fn heater_value(heater: &Heater, field: &str, scale_power: bool) -> Option<Value> {
        match field {
            "temperature" => heater.temperature.map(Value::from),
            "target" => heater.target.map(Value::from),
            "power" if scale_power => heater.power.map(|p| Value::from(p * 100.0)),
            "power" => heater.power.map(Value::from),
            _ => None,
        }
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            manufacturer: "Moonraker",
            sw_version: self.klippy.moonraker_version.clone(),
        }
    }
}
