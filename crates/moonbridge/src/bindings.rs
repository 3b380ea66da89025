//! Entity binding tables for the host framework.
//!
//! The host's sensor, number, and climate platforms are configured from
//! these descriptors: each names the (subsystem, field) pair to read
//! through [`PrinterState::value_of`] and, for writable entities, the
//! G-code template that applies a new value. Range limits live here so
//! the host can enforce them before a command is ever rendered.
//!
//! [`PrinterState::value_of`]: crate::printer::PrinterState::value_of

use crate::command::GcodeTemplate;

/// Read-only data point.
#[derive(Debug, Clone, Copy)]
pub struct SensorBinding {
    pub subsystem: &'static str,
    pub field: &'static str,
    pub name: &'static str,
    pub unit: &'static str,
    pub icon: &'static str,
}

/// Writable numeric setting.
#[derive(Debug, Clone, Copy)]
pub struct NumberBinding {
    pub subsystem: &'static str,
    pub field: &'static str,
    pub name: &'static str,
    pub unit: &'static str,
    pub icon: &'static str,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub gcode: GcodeTemplate,
}

/// Heater exposed as a thermostat: current/target temperature and power
/// are read from the named subsystem, the target is set via G-code.
#[derive(Debug, Clone, Copy)]
pub struct ClimateBinding {
    pub subsystem: &'static str,
    pub name: &'static str,
    pub icon: &'static str,
    pub min_temp: f64,
    pub max_temp: f64,
    pub step: f64,
    pub gcode: GcodeTemplate,
}

pub const SENSORS: &[SensorBinding] = &[
    SensorBinding {
        subsystem: "print_stats",
        field: "state",
        name: "Print state",
        unit: "",
        icon: "mdi:printer-3d",
    },
    SensorBinding {
        subsystem: "display_status",
        field: "progress",
        name: "Print progress",
        unit: "%",
        icon: "mdi:progress-clock",
    },
    SensorBinding {
        subsystem: "extruder",
        field: "temperature",
        name: "Extruder temperature",
        unit: "°C",
        icon: "mdi:printer-3d-nozzle-heat",
    },
    SensorBinding {
        subsystem: "heater_bed",
        field: "temperature",
        name: "Bed temperature",
        unit: "°C",
        icon: "mdi:heating-coil",
    },
    SensorBinding {
        subsystem: "fan",
        field: "speed",
        name: "Part fan speed",
        unit: "%",
        icon: "mdi:fan",
    },
    SensorBinding {
        subsystem: "fan",
        field: "rpm",
        name: "Part fan rpm",
        unit: "rpm",
        icon: "mdi:fan",
    },
    SensorBinding {
        subsystem: "print_stats",
        field: "filename",
        name: "Current file",
        unit: "",
        icon: "mdi:file-outline",
    },
];

pub const NUMBERS: &[NumberBinding] = &[
    NumberBinding {
        subsystem: "extruder",
        field: "pressure_advance",
        name: "Pressure advance",
        unit: "s",
        icon: "mdi:printer-3d-nozzle",
        min: 0.0,
        max: 1.0,
        step: 0.001,
        gcode: GcodeTemplate::new("SET_PRESSURE_ADVANCE EXTRUDER=extruder ADVANCE=", 3),
    },
    NumberBinding {
        subsystem: "toolhead",
        field: "max_accel",
        name: "Maximum accel",
        unit: "mm/s²",
        icon: "mdi:printer-3d",
        min: 0.0,
        max: 10000.0,
        step: 100.0,
        gcode: GcodeTemplate::new("SET_VELOCITY_LIMIT ACCEL=", 0),
    },
    NumberBinding {
        subsystem: "toolhead",
        field: "max_velocity",
        name: "Maximum velocity",
        unit: "mm/s",
        icon: "mdi:printer-3d",
        min: 0.0,
        max: 10000.0,
        step: 5.0,
        gcode: GcodeTemplate::new("SET_VELOCITY_LIMIT VELOCITY=", 0),
    },
    NumberBinding {
        subsystem: "toolhead",
        field: "max_accel_to_decel",
        name: "Maximum accel to decel",
        unit: "mm/s²",
        icon: "mdi:printer-3d",
        min: 0.0,
        max: 10000.0,
        step: 100.0,
        gcode: GcodeTemplate::new("SET_VELOCITY_LIMIT ACCEL_TO_DECEL=", 0),
    },
    NumberBinding {
        subsystem: "toolhead",
        field: "square_corner_velocity",
        name: "Square corner velocity",
        unit: "mm/s",
        icon: "mdi:printer-3d-nozzle",
        min: 0.0,
        max: 100.0,
        step: 0.1,
        gcode: GcodeTemplate::new("SET_VELOCITY_LIMIT SQUARE_CORNER_VELOCITY=", 1),
    },
    NumberBinding {
        subsystem: "fan",
        field: "speed",
        name: "Part fan speed",
        unit: "%",
        icon: "mdi:fan",
        min: 0.0,
        max: 100.0,
        step: 1.0,
        // TODO: M106 takes 0..255; map the percentage once the host UI
        // stops expecting the raw value to round-trip.
        gcode: GcodeTemplate::new("M106 S", 0),
    },
];

pub const CLIMATES: &[ClimateBinding] = &[
    ClimateBinding {
        subsystem: "extruder",
        name: "Extruder",
        icon: "mdi:printer-3d-nozzle",
        min_temp: 0.0,
        max_temp: 300.0,
        step: 1.0,
        gcode: GcodeTemplate::new("SET_HEATER_TEMPERATURE HEATER=extruder TARGET=", 0),
    },
    ClimateBinding {
        subsystem: "heater_bed",
        name: "Heater bed",
        icon: "mdi:heating-coil",
        min_temp: 0.0,
        max_temp: 120.0,
        step: 5.0,
        gcode: GcodeTemplate::new("SET_HEATER_TEMPERATURE HEATER=heater_bed TARGET=", 0),
    },
];

/// Lowercase alphanumeric identifier with underscores, for unique ids
/// derived from configured names.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_was_sep = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            slug.push('_');
            last_was_sep = true;
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Voron 2.4"), "voron_2_4");
        assert_eq!(slugify("MyPrinter"), "myprinter");
        assert_eq!(slugify("  bench printer  "), "bench_printer");
        assert_eq!(slugify("trident"), "trident");
    }

    #[test]
    fn test_sensor_bindings_resolve_against_printer_state() {
        let printer = crate::printer::PrinterState::new(
            "p".to_string(),
            "P".to_string(),
            &["extruder".to_string()],
        );
        // Every binding must be a valid accessor pair: unpopulated fields
        // read as None, but the names themselves are in the allowlist, so
        // populating the field makes the same lookup return a value.
        let mut populated = printer.clone();
        let snapshot = serde_json::json!({
            "toolhead": {
                "max_accel": 1.0, "max_velocity": 1.0,
                "max_accel_to_decel": 1.0, "square_corner_velocity": 1.0,
            },
            "extruder": { "temperature": 1.0, "target": 1.0, "power": 1.0, "pressure_advance": 1.0 },
            "heater_bed": { "temperature": 1.0, "target": 1.0, "power": 1.0 },
            "fan": { "speed": 1.0, "rpm": 1.0 },
            "display_status": { "progress": 1.0 },
            "print_stats": { "state": "x", "filename": "y" },
        });
        populated.apply_snapshot(snapshot.as_object().unwrap());

        for binding in SENSORS {
            assert!(
                populated.value_of(binding.subsystem, binding.field).is_some(),
                "sensor binding {}/{} does not resolve",
                binding.subsystem,
                binding.field
            );
        }
        for binding in NUMBERS {
            assert!(
                populated.value_of(binding.subsystem, binding.field).is_some(),
                "number binding {}/{} does not resolve",
                binding.subsystem,
                binding.field
            );
        }
        for binding in CLIMATES {
            for field in ["temperature", "target", "power"] {
                assert!(populated.value_of(binding.subsystem, field).is_some());
            }
        }
    }

    #[test]
    fn test_number_gcode_precisions() {
        let pa = NUMBERS
            .iter()
            .find(|b| b.field == "pressure_advance")
            .unwrap();
        assert_eq!(
            pa.gcode.render(0.045),
            "SET_PRESSURE_ADVANCE EXTRUDER=extruder ADVANCE=0.045"
        );

        let scv = NUMBERS
            .iter()
            .find(|b| b.field == "square_corner_velocity")
            .unwrap();
        assert_eq!(
            scv.gcode.render(5.0),
            "SET_VELOCITY_LIMIT SQUARE_CORNER_VELOCITY=5.0"
        );

        let fan = NUMBERS.iter().find(|b| b.subsystem == "fan").unwrap();
        assert_eq!(fan.gcode.render(42.0), "M106 S42");
    }
}
