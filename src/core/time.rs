//! Shared timestamp/id helpers and the injectable clock seam.

use chrono::{DateTime, Local};
use std::time::Duration;
use ulid::Ulid;

/// Wall clock + sleep, injectable so poll/retry loops are testable.
pub trait Clock {
    fn now(&self) -> DateTime<Local>;
    fn sleep(&self, duration: Duration);
}

/// Real clock: `chrono::Local` plus blocking `std::thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Returns the current local time as an RFC 3339 string.
pub fn now_iso(clock: &dyn Clock) -> String {
    clock.now().to_rfc3339()
}

/// Returns the current local calendar date (`YYYY-MM-DD`), the key for
/// daily budget windows.
pub fn today_local(clock: &dyn Clock) -> String {
    clock.now().format("%Y-%m-%d").to_string()
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

pub fn new_run_id() -> String {
    format!("bindery-{}", Ulid::new().to_string().to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_iso_is_rfc3339() {
        let clock = SystemClock;
        let ts = now_iso(&clock);
        assert!(DateTime::parse_from_rfc3339(&ts).is_ok());
    }

    #[test]
    fn test_today_local_format() {
        let clock = SystemClock;
        let date = today_local(&clock);
        assert_eq!(date.len(), 10);
        assert_eq!(&date[4..5], "-");
        assert_eq!(&date[7..8], "-");
    }

    #[test]
    fn test_new_event_id_is_unique() {
        assert_ne!(new_event_id(), new_event_id());
    }

    #[test]
    fn test_new_run_id_prefix() {
        assert!(new_run_id().starts_with("bindery-"));
    }
}
