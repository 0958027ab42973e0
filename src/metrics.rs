//! Prometheus exposition of the device registry.
//!
//! Per-device gauges are rebuilt from the registry on every scrape. Completed
//! cycle durations are moved into the `cycle_durations` histogram and cleared
//! from the monitors, so each cycle is observed exactly once.

use crate::clock::Clock;
use crate::error::{AppError, Result};
use crate::registry::DeviceRegistry;
use prometheus::proto::MetricFamily;
use prometheus::{
    linear_buckets, Encoder, GaugeVec, Histogram, HistogramOpts, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use tracing::debug;

const LABELS: &[&str] = &["addr", "mac", "model", "alias", "device_id"];

pub struct Exporter {
    devices: Arc<DeviceRegistry>,
    clock: Arc<dyn Clock>,
    registry: Registry,

    online: IntGauge,
    duty_threshold: GaugeVec,
    voltage: GaugeVec,
    current: GaugeVec,
    power: GaugeVec,
    total_power: GaugeVec,
    current_state: GaugeVec,
    current_on_duration: GaugeVec,
    current_off_duration: GaugeVec,
    last_on_duration: GaugeVec,
    last_off_duration: GaugeVec,
    cycle_count: GaugeVec,

    cycle_durations: Histogram,
}

impl Exporter {
    pub fn new(devices: Arc<DeviceRegistry>, clock: Arc<dyn Clock>) -> Result<Self> {
        let registry = Registry::new();

        let online = IntGauge::new("online", "If plugs are online (constant 1 once sampled)")?;
        registry.register(Box::new(online.clone()))?;

        let gauge = |name: &str, help: &str| -> Result<GaugeVec> {
            let g = GaugeVec::new(Opts::new(name, help), LABELS)?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };

        let duty_threshold = gauge(
            "duty_threshold",
            "Threshold power (in watts) above which the circuit is considered ON.",
        )?;
        let voltage = gauge("voltage", "Instantaneous voltage on the circuit.")?;
        let current = gauge("current", "Instantaneous current (amps) on the circuit.")?;
        let power = gauge("power_watts", "Instantaneous power (watts) on the circuit.")?;
        let total_power = gauge(
            "total_power_kwh",
            "Total power (in KwH) delivered on the circuit.",
        )?;
        let current_state = gauge(
            "current_duty_state",
            "Current state of the duty cycle (1 for on, 0 for off).",
        )?;
        let current_on_duration = gauge(
            "current_on_duration",
            "Duration (in seconds) of the circuit's current ON duty state (0 if not on).",
        )?;
        let current_off_duration = gauge(
            "current_off_duration",
            "Duration (in seconds) of the circuit's current OFF duty state (0 if not off).",
        )?;
        let last_on_duration = gauge(
            "last_on_duration",
            "Duration (in seconds) of the circuit's most recent full ON duty state \
             (0 if none observed).",
        )?;
        let last_off_duration = gauge(
            "last_off_duration",
            "Duration (in seconds) of the circuit's most recent full OFF duty state \
             (0 if none observed).",
        )?;
        let cycle_count = gauge("cycle_count", "Full duty cycles observed")?;

        let cycle_durations = Histogram::with_opts(
            HistogramOpts::new(
                "cycle_durations",
                "Duration (in seconds) of observed duty cycles",
            )
            .buckets(linear_buckets(0.0, 60.0, 60)?),
        )?;
        registry.register(Box::new(cycle_durations.clone()))?;

        Ok(Self {
            devices,
            clock,
            registry,
            online,
            duty_threshold,
            voltage,
            current,
            power,
            total_power,
            current_state,
            current_on_duration,
            current_off_duration,
            last_on_duration,
            last_off_duration,
            cycle_count,
            cycle_durations,
        })
    }

    fn per_device(&self) -> [&GaugeVec; 11] {
        [
            &self.duty_threshold,
            &self.voltage,
            &self.current,
            &self.power,
            &self.total_power,
            &self.current_state,
            &self.current_on_duration,
            &self.current_off_duration,
            &self.last_on_duration,
            &self.last_off_duration,
            &self.cycle_count,
        ]
    }

    /// Refresh every metric from the registry and gather the families.
    ///
    /// The registry write guard is held until after `gather`, so concurrent
    /// scrapes are serialized and never observe the vecs between `reset` and
    /// repopulation.
    pub async fn gather(&self) -> Vec<MetricFamily> {
        let now = self.clock.now();
        let mut monitors = self.devices.write().await;

        for g in self.per_device() {
            g.reset();
        }

        let mut online = 0;
        for (addr, monitor) in monitors.iter_mut() {
            if !monitor.state().has_data() {
                continue;
            }
            online += 1;

            {
                let s = monitor.state();
                let labels = [
                    addr.as_str(),
                    s.identity.mac.as_str(),
                    s.identity.model.as_str(),
                    s.identity.alias.as_str(),
                    s.identity.device_id.as_str(),
                ];
                let set = |g: &GaugeVec, v: f64| g.with_label_values(&labels).set(v);

                set(&self.duty_threshold, monitor.threshold_watts());
                set(&self.voltage, s.reading.voltage);
                set(&self.current, s.reading.current);
                set(&self.power, s.reading.power);
                set(&self.total_power, s.reading.total_kwh);
                set(
                    &self.current_state,
                    if s.cycle.cycle_state { 1.0 } else { 0.0 },
                );
                set(
                    &self.current_on_duration,
                    monitor.current_on_duration(now).as_secs_f64(),
                );
                set(
                    &self.current_off_duration,
                    monitor.current_off_duration(now).as_secs_f64(),
                );
                set(
                    &self.last_on_duration,
                    s.cycle.last_on_duration.as_secs_f64(),
                );
                set(
                    &self.last_off_duration,
                    s.cycle.last_off_duration.as_secs_f64(),
                );
                set(&self.cycle_count, s.cycle.cycle_count as f64);
            }

            for d in monitor.drain_cycle_durations() {
                debug!(addr = %addr, duration = ?d, "flushing histogram observation of cycle");
                self.cycle_durations.observe(d.as_secs_f64());
            }
        }

        self.online.set(online);
        self.registry.gather()
    }

    /// Collect and encode in the Prometheus text format.
    pub async fn render(&self) -> Result<String> {
        let families = self.gather().await;

        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf)?;
        String::from_utf8(buf).map_err(|e| AppError::Other(e.into()))
    }
}
