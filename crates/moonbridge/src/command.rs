//! G-code command formatting.
//!
//! User-initiated mutations (heater targets, velocity limits, fan speed)
//! become single-line G-code strings. Each template carries its own
//! fixed-point precision; firmware-side range limits are enforced by the
//! host's entity layer before a command is rendered.

/// A single-value G-code template: the numeric argument is appended to
/// the prefix with a fixed number of decimals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcodeTemplate {
    pub prefix: &'static str,
    pub decimals: usize,
}

impl GcodeTemplate {
    pub const fn new(prefix: &'static str, decimals: usize) -> Self {
        Self { prefix, decimals }
    }

    pub fn render(&self, value: f64) -> String {
        format!("{}{:.*}", self.prefix, self.decimals, value)
    }
}

/// A rendered command ready for submission, with a human-readable purpose
/// for logging. Created and consumed within one request lifecycle.
#[derive(Debug, Clone)]
pub struct Command {
    pub gcode: String,
    pub purpose: &'static str,
}

impl Command {
    pub fn new(template: &GcodeTemplate, value: f64, purpose: &'static str) -> Self {
        Self {
            gcode: template.render(value),
            purpose,
        }
    }
}
