//! Per-device duty-cycle detection.
//!
//! A [`DutyCycleMonitor`] is fed one successful reading per collection tick and
//! turns the stream of power values into on/off transitions, a cycle counter
//! and the list of completed on-interval durations waiting to be exported.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Descriptive device fields, refreshed on every sample and only used as
/// export labels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceIdentity {
    pub mac: String,
    pub model: String,
    pub alias: String,
    pub feature: String,
    pub rssi: i32,
    pub device_id: String,
    pub software_version: String,
    pub hardware_version: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstantaneousReading {
    /// Watts
    pub power: f64,
    /// Volts
    pub voltage: f64,
    /// Amps
    pub current: f64,
    /// Cumulative energy in kWh
    pub total_kwh: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DutyCycleState {
    #[serde(deserialize_with = "zero_time::deserialize")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "state")]
    pub cycle_state: bool,
    pub cycle_count: u64,
    /// Completed on-intervals awaiting export.
    #[serde(with = "duration_nanos::list")]
    pub cycle_durations: Vec<Duration>,
    #[serde(deserialize_with = "zero_time::deserialize")]
    pub last_on: Option<DateTime<Utc>>,
    #[serde(with = "duration_nanos")]
    pub last_on_duration: Duration,
    #[serde(deserialize_with = "zero_time::deserialize")]
    pub last_off: Option<DateTime<Utc>>,
    #[serde(with = "duration_nanos")]
    pub last_off_duration: Duration,
}

/// Everything known about one device. This is also the checkpoint record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorState {
    #[serde(flatten)]
    pub identity: DeviceIdentity,
    #[serde(flatten)]
    pub cycle: DutyCycleState,
    #[serde(flatten)]
    pub reading: InstantaneousReading,
}

impl MonitorState {
    pub fn has_data(&self) -> bool {
        self.cycle.timestamp.is_some()
    }
}

/// What a single sample did to the state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    /// First reading ever; state seeded without counting a cycle.
    Bootstrap { on: bool },
    /// Low-to-high edge, with the length of the off-interval it ended.
    TurnedOn { off_for: Option<Duration> },
    /// High-to-low edge, with the length of the on-interval it completed.
    TurnedOff { on_for: Option<Duration> },
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct DutyCycleMonitor {
    threshold_watts: f64,
    sampled: bool,
    state: MonitorState,
}

impl DutyCycleMonitor {
    pub fn new(threshold_watts: f64) -> Self {
        Self::restore(threshold_watts, MonitorState::default())
    }

    /// Resume from a checkpointed state; the restored `cycle_state` is taken as
    /// authoritative, so no bootstrap happens on the next sample.
    pub fn restore(threshold_watts: f64, state: MonitorState) -> Self {
        Self {
            threshold_watts,
            sampled: false,
            state,
        }
    }

    pub fn threshold_watts(&self) -> f64 {
        self.threshold_watts
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    pub fn sample(
        &mut self,
        now: DateTime<Utc>,
        identity: DeviceIdentity,
        reading: InstantaneousReading,
    ) -> Transition {
        let first = self.state.cycle.timestamp.is_none() && !self.sampled;
        debug!(
            model = %identity.model,
            alias = %identity.alias,
            power = reading.power,
            current = reading.current,
            voltage = reading.voltage,
            "sampling"
        );

        self.sampled = true;
        self.state.identity = identity;
        self.state.reading = reading;

        let on = reading.power >= self.threshold_watts;
        let cycle = &mut self.state.cycle;
        cycle.timestamp = Some(now);

        if first {
            cycle.cycle_state = on;
            if on {
                cycle.last_on = Some(now);
            } else {
                cycle.last_off = Some(now);
            }
            info!(on, at = %now, "no prior state, seeding duty state");
            return Transition::Bootstrap { on };
        }

        if on && !cycle.cycle_state {
            cycle.cycle_state = true;
            let off_for = cycle.last_off.map(|off| elapsed(off, now));
            if let Some(d) = off_for {
                cycle.last_off_duration = d;
            }
            cycle.last_on = Some(now);
            info!(
                power = reading.power,
                off_for = ?cycle.last_off_duration,
                "low-to-high transition"
            );
            Transition::TurnedOn { off_for }
        } else if !on && cycle.cycle_state {
            cycle.cycle_state = false;
            let on_for = cycle.last_on.map(|on_at| elapsed(on_at, now));
            if let Some(d) = on_for {
                cycle.last_on_duration = d;
                cycle.cycle_durations.push(d);
                cycle.cycle_count += 1;
            }
            cycle.last_off = Some(now);
            info!(
                power = reading.power,
                on_for = ?cycle.last_on_duration,
                "high-to-low transition"
            );
            Transition::TurnedOff { on_for }
        } else {
            Transition::Unchanged
        }
    }

    /// Time spent in the current on-state, zero while off.
    pub fn current_on_duration(&self, now: DateTime<Utc>) -> Duration {
        match (self.state.cycle.cycle_state, self.state.cycle.last_on) {
            (true, Some(on)) => elapsed(on, now),
            _ => Duration::ZERO,
        }
    }

    /// Time spent in the current off-state, zero while on.
    pub fn current_off_duration(&self, now: DateTime<Utc>) -> Duration {
        match (self.state.cycle.cycle_state, self.state.cycle.last_off) {
            (false, Some(off)) => elapsed(off, now),
            _ => Duration::ZERO,
        }
    }

    /// Hand over the completed cycle durations and clear the pending list.
    pub fn drain_cycle_durations(&mut self) -> Vec<Duration> {
        std::mem::take(&mut self.state.cycle.cycle_durations)
    }
}

/// `to - from`, saturating at zero if the clock went backwards.
fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or_default()
}

/// `0001-01-01T00:00:00Z` is the zero time written by Go encoders and means
/// "never", same as `null`.
mod zero_time {
    use chrono::{DateTime, Datelike, Utc};
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let ts = Option::<DateTime<Utc>>::deserialize(d)?;
        Ok(ts.filter(|t| t.year() > 1))
    }
}

/// Durations are stored as signed integer nanoseconds. Negative values read
/// back as zero.
mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(to_nanos(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        i64::deserialize(d).map(from_nanos)
    }

    fn to_nanos(d: &Duration) -> i64 {
        i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
    }

    fn from_nanos(n: i64) -> Duration {
        Duration::from_nanos(u64::try_from(n).unwrap_or(0))
    }

    pub mod list {
        use super::*;
        use serde::ser::SerializeSeq;

        pub fn serialize<S: Serializer>(v: &[Duration], s: S) -> Result<S::Ok, S::Error> {
            let mut seq = s.serialize_seq(Some(v.len()))?;
            for d in v {
                seq.serialize_element(&to_nanos(d))?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Duration>, D::Error> {
            let nanos = Option::<Vec<i64>>::deserialize(d)?;
            Ok(nanos
                .unwrap_or_default()
                .into_iter()
                .map(from_nanos)
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    const THRESHOLD: f64 = 5.0;

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 12, 20, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            mac: "aa:bb:cc:dd:ee".into(),
            model: "HS110(US)".into(),
            alias: "freezer".into(),
            feature: "TIM:ENE".into(),
            rssi: -42,
            device_id: "FFFF".into(),
            software_version: "1.2.3".into(),
            hardware_version: "2.3.4".into(),
        }
    }

    fn off() -> InstantaneousReading {
        InstantaneousReading {
            power: 0.05,
            voltage: 115.0,
            current: 0.05,
            total_kwh: 1234.5,
        }
    }

    fn on() -> InstantaneousReading {
        InstantaneousReading {
            power: 90.0,
            voltage: 115.0,
            current: 0.45,
            total_kwh: 1234.5,
        }
    }

    fn watts(power: f64) -> InstantaneousReading {
        InstantaneousReading {
            power,
            ..off()
        }
    }

    #[test]
    fn test_first_sample_below_threshold_seeds_off() {
        let mut m = DutyCycleMonitor::new(THRESHOLD);
        let tr = m.sample(t(0), identity(), off());

        assert_eq!(tr, Transition::Bootstrap { on: false });
        let c = &m.state().cycle;
        assert!(!c.cycle_state);
        assert_eq!(c.last_off, Some(t(0)));
        assert_eq!(c.last_on, None);
        assert_eq!(c.cycle_count, 0);
        assert!(c.cycle_durations.is_empty());
        assert_eq!(c.timestamp, Some(t(0)));
    }

    #[test]
    fn test_first_sample_above_threshold_seeds_on() {
        let mut m = DutyCycleMonitor::new(THRESHOLD);
        let tr = m.sample(t(0), identity(), on());

        assert_eq!(tr, Transition::Bootstrap { on: true });
        let c = &m.state().cycle;
        assert!(c.cycle_state);
        assert_eq!(c.last_on, Some(t(0)));
        assert_eq!(c.last_off, None);
        assert_eq!(c.cycle_count, 0);
    }

    #[test]
    fn test_threshold_is_inclusive_on_the_on_side() {
        let mut m = DutyCycleMonitor::new(THRESHOLD);
        m.sample(t(0), identity(), watts(THRESHOLD));
        assert!(m.state().cycle.cycle_state);

        m.sample(t(1), identity(), watts(4.999));
        assert!(!m.state().cycle.cycle_state);
        assert_eq!(m.state().cycle.cycle_count, 1);
    }

    #[test]
    fn test_off_on_off_on_sequence() {
        let mut m = DutyCycleMonitor::new(THRESHOLD);
        let mut states = Vec::new();

        m.sample(t(0), identity(), off());
        states.push(m.state().cycle.cycle_state);

        let tr = m.sample(t(10), identity(), on());
        states.push(m.state().cycle.cycle_state);
        assert_eq!(
            tr,
            Transition::TurnedOn {
                off_for: Some(Duration::from_secs(600))
            }
        );
        assert_eq!(m.state().cycle.last_on, Some(t(10)));
        assert_eq!(m.state().cycle.last_off_duration, Duration::from_secs(600));
        assert_eq!(m.state().cycle.cycle_count, 0);

        let tr = m.sample(t(25), identity(), off());
        states.push(m.state().cycle.cycle_state);
        assert_eq!(
            tr,
            Transition::TurnedOff {
                on_for: Some(Duration::from_secs(900))
            }
        );
        assert_eq!(m.state().cycle.cycle_count, 1);
        assert_eq!(
            m.state().cycle.cycle_durations,
            vec![Duration::from_secs(900)]
        );
        assert_eq!(m.state().cycle.last_on_duration, Duration::from_secs(900));

        m.sample(t(30), identity(), on());
        states.push(m.state().cycle.cycle_state);
        assert_eq!(m.state().cycle.last_off_duration, Duration::from_secs(300));

        assert_eq!(states, vec![false, true, false, true]);
    }

    #[test]
    fn test_repeated_samples_on_same_side_do_not_transition() {
        let mut m = DutyCycleMonitor::new(THRESHOLD);
        m.sample(t(0), identity(), on());
        for i in 1..10 {
            assert_eq!(m.sample(t(i), identity(), on()), Transition::Unchanged);
        }
        let c = &m.state().cycle;
        assert!(c.cycle_state);
        assert_eq!(c.last_on, Some(t(0)));
        assert_eq!(c.timestamp, Some(t(9)));
        assert_eq!(c.cycle_count, 0);
    }

    #[test]
    fn test_cycle_count_matches_completed_transitions() {
        let mut m = DutyCycleMonitor::new(THRESHOLD);
        let pattern = [on(), on(), off(), on(), off(), off(), on(), off(), on()];
        let mut falls = 0;
        for (i, r) in pattern.iter().enumerate() {
            if let Transition::TurnedOff { .. } = m.sample(t(i as i64), identity(), *r) {
                falls += 1;
            }
        }
        assert_eq!(falls, 3);
        assert_eq!(m.state().cycle.cycle_count, 3);
        assert_eq!(m.state().cycle.cycle_durations.len(), 3);

        let drained = m.drain_cycle_durations();
        assert_eq!(drained.len(), 3);
        assert!(m.state().cycle.cycle_durations.is_empty());
        assert_eq!(m.state().cycle.cycle_count, 3);

        m.sample(t(20), identity(), off());
        assert_eq!(m.state().cycle.cycle_count, 4);
        assert_eq!(m.state().cycle.cycle_durations.len(), 1);
    }

    #[test]
    fn test_identity_and_reading_refresh_every_sample() {
        let mut m = DutyCycleMonitor::new(THRESHOLD);
        m.sample(t(0), identity(), on());

        let mut renamed = identity();
        renamed.alias = "chest freezer".into();
        renamed.rssi = -60;
        let mut reading = on();
        reading.total_kwh = 1240.0;
        m.sample(t(1), renamed.clone(), reading);

        assert_eq!(m.state().identity, renamed);
        assert_eq!(m.state().reading, reading);
    }

    #[test]
    fn test_restored_state_is_authoritative() {
        let mut restored = MonitorState::default();
        restored.cycle.timestamp = Some(t(0));
        restored.cycle.cycle_state = true;
        restored.cycle.last_on = Some(t(-30));
        restored.cycle.cycle_count = 7;

        let mut m = DutyCycleMonitor::restore(THRESHOLD, restored);
        let tr = m.sample(t(1), identity(), off());

        assert_eq!(
            tr,
            Transition::TurnedOff {
                on_for: Some(Duration::from_secs(31 * 60))
            }
        );
        assert_eq!(m.state().cycle.cycle_count, 8);
    }

    #[test]
    fn test_current_durations() {
        let mut m = DutyCycleMonitor::new(THRESHOLD);
        m.sample(t(0), identity(), on());
        assert_eq!(m.current_on_duration(t(5)), Duration::from_secs(300));
        assert_eq!(m.current_off_duration(t(5)), Duration::ZERO);

        m.sample(t(10), identity(), off());
        assert_eq!(m.current_on_duration(t(12)), Duration::ZERO);
        assert_eq!(m.current_off_duration(t(12)), Duration::from_secs(120));
    }

    #[test]
    fn test_clock_going_backwards_saturates() {
        let mut m = DutyCycleMonitor::new(THRESHOLD);
        m.sample(t(10), identity(), on());
        m.sample(t(5), identity(), off());
        assert_eq!(m.state().cycle.last_on_duration, Duration::ZERO);
        assert_eq!(m.state().cycle.cycle_count, 1);
    }

    #[test]
    fn test_state_serializes_to_flat_record() {
        let mut m = DutyCycleMonitor::new(THRESHOLD);
        m.sample(t(0), identity(), on());
        m.sample(t(1), identity(), off());

        let v = serde_json::to_value(m.state()).unwrap();
        assert_eq!(v["mac"], "aa:bb:cc:dd:ee");
        assert_eq!(v["state"], false);
        assert_eq!(v["cycle_count"], 1);
        assert_eq!(v["cycle_durations"][0], 60_000_000_000u64);
        assert_eq!(v["last_on_duration"], 60_000_000_000u64);
        assert_eq!(v["power"], 0.05);
        assert_eq!(v["total_kwh"], 1234.5);
    }

    #[test]
    fn test_zero_time_and_negative_durations_decode() {
        let raw = r#"{
            "alias": "garage",
            "timestamp": "2024-03-12T21:00:00Z",
            "state": true,
            "cycle_count": 2,
            "cycle_durations": [-5, 120000000000],
            "last_on": "0001-01-01T00:00:00Z",
            "last_on_duration": -1,
            "last_off": "2024-03-12T20:50:00Z",
            "last_off_duration": 0
        }"#;
        let state: MonitorState = serde_json::from_str(raw).unwrap();

        assert_eq!(state.cycle.timestamp, Some(t(60)));
        assert_eq!(state.cycle.last_on, None);
        assert_eq!(state.cycle.last_on_duration, Duration::ZERO);
        assert_eq!(
            state.cycle.cycle_durations,
            vec![Duration::ZERO, Duration::from_secs(120)]
        );
        assert_eq!(state.cycle.last_off, Some(t(50)));

        // Without a known start the on-interval is not counted.
        let mut m = DutyCycleMonitor::restore(THRESHOLD, state);
        let tr = m.sample(t(61), identity(), off());
        assert_eq!(tr, Transition::TurnedOff { on_for: None });
        assert_eq!(m.state().cycle.cycle_count, 2);
        assert_eq!(m.state().cycle.last_on_duration, Duration::ZERO);
    }
}
