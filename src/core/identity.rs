//! Sensor identity allocation.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use super::model::SensorId;

/// Source of candidate ids for the bind handler.
///
/// Candidates are not guaranteed unique; the bind handler checks them
/// against the registry.
pub trait IdentityAllocator: Send + Sync {
    fn allocate(&self) -> SensorId;
}

/// `(unix_millis mod 1_000_000) + uniform(1..=1000)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockIdentity;

impl ClockIdentity {
    pub fn compose(unix_millis: u128, jitter: u64) -> SensorId {
        // u128 % 1_000_000 always fits in u64
        SensorId((unix_millis % 1_000_000) as u64 + jitter)
    }
}

impl IdentityAllocator for ClockIdentity {
    fn allocate(&self) -> SensorId {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let jitter = rand::thread_rng().gen_range(1..=1000);
        Self::compose(millis, jitter)
    }
}

/// Hands out a fixed list of ids, repeating the last one once exhausted.
#[cfg(test)]
pub(crate) struct ScriptedIdentity {
    ids: std::sync::Mutex<std::collections::VecDeque<u64>>,
}

#[cfg(test)]
impl ScriptedIdentity {
    pub(crate) fn new(ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            ids: std::sync::Mutex::new(ids.into_iter().collect()),
        }
    }
}

#[cfg(test)]
impl IdentityAllocator for ScriptedIdentity {
    fn allocate(&self) -> SensorId {
        let mut ids = self.ids.lock().unwrap();
        let id = if ids.len() > 1 {
            ids.pop_front().unwrap()
        } else {
            *ids.front().unwrap()
        };
        SensorId(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_wraps_clock() {
        assert_eq!(ClockIdentity::compose(1_700_000_123_456, 1), SensorId(123_457));
        assert_eq!(ClockIdentity::compose(999_999, 1000), SensorId(1_000_999));
    }

    #[test]
    fn test_allocate_range() {
        for _ in 0..100 {
            let id = ClockIdentity.allocate().get();
            assert!((1..=1_000_999).contains(&id));
        }
    }

    #[test]
    fn test_scripted_repeats_last() {
        let ids = ScriptedIdentity::new([5, 6]);
        assert_eq!(ids.allocate(), SensorId(5));
        assert_eq!(ids.allocate(), SensorId(6));
        assert_eq!(ids.allocate(), SensorId(6));
    }
}
