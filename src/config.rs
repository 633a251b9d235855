use ash::vk;
use parking_lot::RwLock;
use std::collections::HashMap;

/// One `(staging buffer size, count)` pair pre-allocated at transfer-engine
/// startup. Mirrors the original engine's `g_stagingReserve` table.
#[derive(Debug, Clone, Copy)]
pub struct TransferReserve {
    pub size: vk::DeviceSize,
    pub count: u32,
}

impl TransferReserve {
    pub fn new(size: vk::DeviceSize, count: u32) -> Self {
        Self { size, count }
    }
}

/// Default staging-buffer reserve, carried over from the original engine's
/// `g_stagingReserve` table (256MB x1, 64MB x2, 8MB x4).
pub fn default_transfer_reserve() -> Vec<TransferReserve> {
    vec![
        TransferReserve::new(256 << 20, 1),
        TransferReserve::new(64 << 20, 2),
        TransferReserve::new(8 << 20, 4),
    ]
}

/// Top-level engine configuration, covering every row of the configuration
/// table. Not a file format — this core never reads or writes files, all
/// options arrive as plain values from the embedder.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub validation: bool,
    pub in_flight_frames: u32,
    pub vsync: bool,
    pub transfer_reserve: Vec<TransferReserve>,
    pub preferred_device_name: Option<String>,
    pub colour_format_preferences: Vec<vk::Format>,
    pub present_mode_preferences: Vec<vk::PresentModeKHR>,
    pub dedicated_transfer_queue: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
            in_flight_frames: 2,
            vsync: true,
            transfer_reserve: default_transfer_reserve(),
            preferred_device_name: None,
            colour_format_preferences: Vec::new(),
            present_mode_preferences: Vec::new(),
            dedicated_transfer_queue: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.in_flight_frames < 1 || self.in_flight_frames > 3 {
            return Err(format!(
                "in_flight_frames must be within 1..=3, got {}",
                self.in_flight_frames
            ));
        }
        Ok(())
    }
}

/// Diagnostic, runtime-overridable toggles keyed by string. Allows flipping
/// `validation` on/off without rebuilding, per spec.
#[derive(Default)]
pub struct EnvironmentOverrides {
    values: RwLock<HashMap<String, String>>,
}

impl EnvironmentOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: impl Into<String>) {
        self.values.write().insert(key.to_owned(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    /// Resolves the effective `validation` flag: runtime override if set,
    /// otherwise the config value baked in at construction time.
    pub fn validation_override(&self, config_default: bool) -> bool {
        match self.get("validation").as_deref() {
            Some("on") | Some("true") | Some("1") => true,
            Some("off") | Some("false") | Some("0") => false,
            _ => config_default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_frames_bounds_are_enforced() {
        let mut config = EngineConfig::default();
        config.in_flight_frames = 0;
        assert!(config.validate().is_err());
        config.in_flight_frames = 4;
        assert!(config.validate().is_err());
        config.in_flight_frames = 3;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn environment_override_takes_precedence() {
        let overrides = EnvironmentOverrides::new();
        assert!(overrides.validation_override(true));
        overrides.set("validation", "off");
        assert!(!overrides.validation_override(true));
        overrides.set("validation", "on");
        assert!(overrides.validation_override(false));
    }
}
