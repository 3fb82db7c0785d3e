//! The alarm registry
//!
//! Alarms are keyed by `(origin, name)`. Raising replaces any existing
//! entry for the key; clearing removes it. Both are idempotent under
//! repeated delivery, which matters because processes re-send alarms on
//! reconnect.

use std::collections::HashMap;
use tracing::info;
use types::Alarm;

/// All alarms currently active in this daemon
#[derive(Default)]
pub struct AlarmRegistry {
    alarms: HashMap<(String, String), Alarm>,
}

impl AlarmRegistry {
    pub fn new() -> AlarmRegistry {
        AlarmRegistry::default()
    }

    /// Insert or remove depending on whether the alarm is on or off
    pub fn process(&mut self, alarm: Alarm) {
        let key = (
            alarm.origin_name().to_string(),
            alarm.name().to_string(),
        );
        if alarm.is_on() {
            info!(
                alarm = %alarm.name(),
                origin = %alarm.origin_name(),
                severity = ?alarm.severity(),
                comment = alarm.comment_text().unwrap_or(""),
                "alarm raised"
            );
            self.alarms.insert(key, alarm);
        } else {
            info!(alarm = %alarm.name(), origin = %alarm.origin_name(), "alarm cleared");
            self.alarms.remove(&key);
        }
    }

    /// Point-in-time snapshot, ordered by key for stable output
    pub fn snapshot(&self) -> Vec<Alarm> {
        let mut keys: Vec<&(String, String)> = self.alarms.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| self.alarms[key].clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.alarms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alarms.is_empty()
    }

    pub fn contains(&self, origin: &str, name: &str) -> bool {
        self.alarms
            .contains_key(&(origin.to_string(), name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::Severity;

    #[test]
    fn raise_replace_clear() {
        let mut registry = AlarmRegistry::new();
        registry.process(Alarm::new("disk-low", Severity::Warning).origin("host-1"));
        registry.process(Alarm::new("disk-low", Severity::Error).origin("host-1"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot()[0].severity(), Severity::Error);

        // Clearing is idempotent
        registry.process(Alarm::new("disk-low", Severity::Warning).origin("host-1").off());
        registry.process(Alarm::new("disk-low", Severity::Warning).origin("host-1").off());
        assert!(registry.is_empty());
    }

    #[test]
    fn distinct_origins_are_distinct_alarms() {
        let mut registry = AlarmRegistry::new();
        registry.process(Alarm::new("disk-low", Severity::Warning).origin("host-1"));
        registry.process(Alarm::new("disk-low", Severity::Warning).origin("host-2"));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("host-1", "disk-low"));
        assert!(registry.contains("host-2", "disk-low"));
    }
}
