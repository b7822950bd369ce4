use crate::telemetry::{Publisher, TOPIC_POWER_MA};

pub const READING_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("current sensor did not answer in time")]
pub struct PeripheralTimeout;

/// The current-sense peripheral. One reading is three big-endian words; only
/// the first carries the current channel.
pub trait CurrentSensor {
    fn read_raw(&mut self) -> Result<[u8; READING_LEN], PeripheralTimeout>;
}

/// Curve fit of raw counts to milliamps, clamped at zero.
pub fn milliamps_from_raw(raw: u32) -> i32 {
    let x = raw as f64;
    let y = 29125.43749 * x / (x + 103257.9289) - 12813.31867 * x / (x + 48884.1186);
    if y < 0.0 {
        0
    } else {
        y as i32
    }
}

#[derive(Debug, Clone)]
pub struct PowerMonitor {
    interval_ms: u64,
    last_sample_ms: Option<u64>,
    last_ma: i32,
}

impl PowerMonitor {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_sample_ms: None,
            last_ma: 0,
        }
    }

    pub fn current_ma(&self) -> i32 {
        self.last_ma
    }

    pub fn stop(&mut self) {
        self.last_ma = 0;
        self.last_sample_ms = None;
    }

    /// Samples and publishes `powerma` once per interval. A sensor timeout
    /// counts as a zero reading.
    pub fn step<S, T>(&mut self, now_ms: u64, sensor: &mut S, telemetry: &mut T) -> Option<i32>
    where
        S: CurrentSensor + ?Sized,
        T: Publisher + ?Sized,
    {
        if let Some(last) = self.last_sample_ms {
            if now_ms.saturating_sub(last) < self.interval_ms {
                return None;
            }
        }
        self.last_sample_ms = Some(now_ms);

        let raw = match sensor.read_raw() {
            Ok(reading) => u32::from_be_bytes([reading[0], reading[1], reading[2], reading[3]]),
            Err(err) => {
                log::debug!("power monitor: {err}; reporting zero");
                0
            }
        };

        self.last_ma = milliamps_from_raw(raw);
        telemetry.publish_int(TOPIC_POWER_MA, self.last_ma);
        Some(self.last_ma)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::CapturingPublisher;

    struct FixedSensor(Result<[u8; READING_LEN], PeripheralTimeout>);

    impl CurrentSensor for FixedSensor {
        fn read_raw(&mut self) -> Result<[u8; READING_LEN], PeripheralTimeout> {
            self.0
        }
    }

    fn reading(raw: u32) -> [u8; READING_LEN] {
        let mut bytes = [0; READING_LEN];
        bytes[..4].copy_from_slice(&raw.to_be_bytes());
        bytes
    }

    #[test]
    fn curve_fit_is_zero_at_rest_and_grows() {
        assert_eq!(milliamps_from_raw(0), 0);
        let low = milliamps_from_raw(20_000);
        let high = milliamps_from_raw(200_000);
        assert!(low >= 0);
        assert!(high > low);
    }

    #[test]
    fn samples_once_per_interval() {
        let mut monitor = PowerMonitor::new(10_000);
        let mut sensor = FixedSensor(Ok(reading(200_000)));
        let mut telemetry = CapturingPublisher::default();

        assert!(monitor.step(0, &mut sensor, &mut telemetry).is_some());
        assert!(monitor.step(9_999, &mut sensor, &mut telemetry).is_none());
        assert!(monitor.step(10_000, &mut sensor, &mut telemetry).is_some());
        assert_eq!(telemetry.values("powerma").len(), 2);
        assert_eq!(monitor.current_ma(), milliamps_from_raw(200_000));
    }

    #[test]
    fn timeout_reads_as_zero() {
        let mut monitor = PowerMonitor::new(10_000);
        let mut sensor = FixedSensor(Err(PeripheralTimeout));
        let mut telemetry = CapturingPublisher::default();

        assert_eq!(monitor.step(0, &mut sensor, &mut telemetry), Some(0));
        assert_eq!(telemetry.values("powerma"), vec!["0".to_string()]);
    }
}
