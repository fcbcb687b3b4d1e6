/// Forwards progress values only when they move forward
///
/// The upstream pipeline reports a placeholder value (the sentinel) as its very
/// first progress event while it is still preparing; that one value is dropped.
#[derive(Debug, Clone)]
pub struct ProgressGuard {
    sentinel: Option<u8>,
    first_scalar_seen: bool,
    last: u8,
}

impl ProgressGuard {
    pub fn new(sentinel: u8) -> Self {
        Self {
            sentinel: Some(sentinel),
            first_scalar_seen: false,
            last: 0,
        }
    }

    /// Guard without sentinel handling, for byte-derived progress
    pub fn plain() -> Self {
        Self {
            sentinel: None,
            first_scalar_seen: true,
            last: 0,
        }
    }

    /// Continue after a reattach, never going below what was already shown
    pub fn resume_from(sentinel: u8, last: u8) -> Self {
        Self {
            last: last.min(100),
            ..Self::new(sentinel)
        }
    }

    pub fn last(&self) -> u8 {
        self.last
    }

    /// Server-reported percentage
    pub fn scalar(&mut self, value: f64) -> Option<u8> {
        if !value.is_finite() {
            return None;
        }
        let value = value.clamp(0.0, 100.0).floor() as u8;

        if !self.first_scalar_seen {
            self.first_scalar_seen = true;
            if self.sentinel == Some(value) {
                return None;
            }
        }
        self.advance(value)
    }

    /// Percentage derived from a count of parts or bytes
    pub fn derived(&mut self, received: u64, total: u64) -> Option<u8> {
        if total == 0 {
            return None;
        }
        let pct = (received.min(total) * 100 / total) as u8;
        self.advance(pct)
    }

    pub fn advance(&mut self, value: u8) -> Option<u8> {
        let value = value.min(100);
        if value > self.last {
            self.last = value;
            Some(value)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sentinel_is_dropped() {
        let mut guard = ProgressGuard::new(95);
        assert_eq!(guard.scalar(95.0), None);
        assert_eq!(guard.scalar(40.0), Some(40));
        assert_eq!(guard.scalar(95.0), Some(95));
    }

    #[test]
    fn test_sentinel_only_checked_on_first_value() {
        let mut guard = ProgressGuard::new(95);
        assert_eq!(guard.scalar(10.0), Some(10));
        assert_eq!(guard.scalar(95.0), Some(95));
    }

    #[test]
    fn test_values_never_go_backwards() {
        let mut guard = ProgressGuard::new(95);
        assert_eq!(guard.scalar(30.0), Some(30));
        assert_eq!(guard.scalar(20.0), None);
        assert_eq!(guard.scalar(30.0), None);
        assert_eq!(guard.scalar(250.0), Some(100));
        assert_eq!(guard.scalar(f64::NAN), None);
    }

    #[test]
    fn test_resume_seeds_floor() {
        let mut guard = ProgressGuard::resume_from(95, 60);
        assert_eq!(guard.scalar(95.0), None);
        assert_eq!(guard.scalar(50.0), None);
        assert_eq!(guard.scalar(61.0), Some(61));
    }

    #[test]
    fn test_derived_progress() {
        let mut guard = ProgressGuard::plain();
        assert_eq!(guard.derived(1, 3), Some(33));
        assert_eq!(guard.derived(1, 3), None);
        assert_eq!(guard.derived(3, 3), Some(100));
        assert_eq!(guard.derived(1, 0), None);
    }
}
