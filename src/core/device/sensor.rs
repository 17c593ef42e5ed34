use rand::Rng;

/// Source of relative humidity readings.
pub trait Sensor: Send {
    fn read(&mut self) -> f64;
}

/// Uniform readings in `[0, 100]`, rounded to two decimals.
#[derive(Debug, Default)]
pub struct SyntheticSensor;

impl Sensor for SyntheticSensor {
    fn read(&mut self) -> f64 {
        let raw: f64 = rand::thread_rng().gen_range(0.0..=100.0);
        (raw * 100.0).round() / 100.0
    }
}

/// Replays a fixed sequence, repeating the last value.
#[cfg(test)]
pub(crate) struct FixedSensor {
    readings: Vec<f64>,
    next: usize,
}

#[cfg(test)]
impl FixedSensor {
    pub(crate) fn new(readings: Vec<f64>) -> Self {
        Self { readings, next: 0 }
    }
}

#[cfg(test)]
impl Sensor for FixedSensor {
    fn read(&mut self) -> f64 {
        let index = self.next.min(self.readings.len().saturating_sub(1));
        self.next += 1;
        self.readings.get(index).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_range_and_precision() {
        let mut sensor = SyntheticSensor;
        for _ in 0..500 {
            let value = sensor.read();
            assert!((0.0..=100.0).contains(&value));
            assert!(((value * 100.0).round() - value * 100.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_fixed_sensor_repeats_last() {
        let mut sensor = FixedSensor::new(vec![1.5, 2.5]);
        assert_eq!(sensor.read(), 1.5);
        assert_eq!(sensor.read(), 2.5);
        assert_eq!(sensor.read(), 2.5);
    }
}
