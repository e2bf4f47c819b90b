//! Default value functions for serde deserialization.

pub fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_rate() -> u32 {
    10
}

pub fn default_burst() -> u32 {
    10
}

pub fn default_cooldown_ms() -> u64 {
    5 * 60 * 1000
}
