use crate::error::{Result, invariant_violation};

/// Outcome of dropping one reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Retained,
    // A destroy was requested while reserved and this was the last hold.
    DestroyNow,
}

/// Per-subscriber hold count with deferred destruction.
///
/// Destruction is a pure function of the count reaching zero while a
/// destroy is pending.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reservations {
    count: usize,
    awaiting_destruction: bool,
}

impl Reservations {
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_reserved(&self) -> bool {
        self.count > 0
    }

    pub fn awaiting_destruction(&self) -> bool {
        self.awaiting_destruction
    }

    pub fn reserve(&mut self) -> usize {
        self.count += 1;
        self.count
    }

    pub fn release(&mut self, suppress_destroy: bool) -> Result<Release> {
        let Some(count) = self.count.checked_sub(1) else {
            return Err(invariant_violation!("subscriber released more times than reserved"));
        };
        self.count = count;
        if count == 0 && self.awaiting_destruction && !suppress_destroy {
            return Ok(Release::DestroyNow);
        }
        Ok(Release::Retained)
    }

    /// Returns true when the caller may free immediately; otherwise the
    /// destroy is remembered until the last release.
    pub fn request_destroy(&mut self) -> bool {
        if self.count > 0 {
            self.awaiting_destruction = true;
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroy_without_reservations_is_immediate() {
        let mut reservations = Reservations::default();
        assert!(reservations.request_destroy());
        assert!(!reservations.awaiting_destruction());
    }

    #[test]
    fn destroy_defers_until_last_release() {
        let mut reservations = Reservations::default();
        reservations.reserve();
        reservations.reserve();
        assert!(!reservations.request_destroy());
        assert_eq!(reservations.release(false).expect("release"), Release::Retained);
        assert_eq!(reservations.release(false).expect("release"), Release::DestroyNow);
        assert_eq!(reservations.count(), 0);
    }

    #[test]
    fn suppressed_release_keeps_subscriber() {
        let mut reservations = Reservations::default();
        reservations.reserve();
        reservations.request_destroy();
        assert_eq!(reservations.release(true).expect("release"), Release::Retained);
        assert!(reservations.awaiting_destruction());
        // A later destroy request can now free right away.
        assert!(reservations.request_destroy());
    }

    #[test]
    fn interleaved_reserve_release_never_underflows() {
        let mut reservations = Reservations::default();
        for round in 0..16 {
            for _ in 0..=round % 3 {
                reservations.reserve();
            }
            while reservations.is_reserved() {
                reservations.release(false).expect("release");
            }
            assert_eq!(reservations.count(), 0);
        }
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "released more times than reserved")]
    fn release_underflow_panics_in_debug() {
        let mut reservations = Reservations::default();
        let _ = reservations.release(false);
    }
}
