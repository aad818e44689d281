//! FXL load reply parsing and the saturated-load warning.

use std::time::{Duration, Instant};

/// Minimum spacing between saturated-load warnings.
pub const WARNING_INTERVAL: Duration = Duration::from_millis(1500);

/// Extract the percentage from an `FXL <pct>%` reply: "FXL", at least
/// one space, one to three digits, a point, exactly two digits, "%".
pub fn parse_flex_load(reply: &str) -> Option<f32> {
    let rest = &reply[reply.find("FXL")? + 3..];
    let trimmed = rest.trim_start_matches(' ');
    if trimmed.len() == rest.len() {
        return None; // no space after the mnemonic
    }
    let digits = trimmed.bytes().take_while(|b| b.is_ascii_digit()).count();
    if !(1..=3).contains(&digits) {
        return None;
    }
    let (whole, tail) = trimmed.split_at(digits);
    let frac = tail.strip_prefix('.')?;
    if frac.len() < 3 || !frac.as_bytes()[..2].iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if frac.as_bytes()[2] != b'%' {
        return None;
    }
    format!("{}.{}", whole, &frac[..2]).parse().ok()
}

/// Watches FXL replies and warns, at most once per interval, when the
/// FPGA reports a saturated flex load.
pub struct LoadMonitor {
    interval: Duration,
    last_warning: Option<Instant>,
}

impl LoadMonitor {
    pub fn new() -> Self {
        Self::with_interval(WARNING_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            last_warning: None,
        }
    }

    /// Feed one reply; returns true when a warning was printed.
    pub fn observe(&mut self, reply: &str) -> bool {
        let Some(percent) = parse_flex_load(reply) else {
            return false;
        };
        if percent != 100.0 {
            return false;
        }
        if let Some(last) = self.last_warning {
            if last.elapsed() < self.interval {
                return false;
            }
        }
        self.last_warning = Some(Instant::now());
        println!("{:.2}%", percent);
        println!("=======================================================");
        println!("WARNING: FLEX LOAD IS AT 100%.  YOU MAY BE MISSING DATA");
        println!("=======================================================");
        true
    }
}

impl Default for LoadMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_replies() {
        assert_eq!(parse_flex_load("FXL 042.17%"), Some(42.17));
        assert_eq!(parse_flex_load("FXL 100.00%"), Some(100.0));
        assert_eq!(parse_flex_load("FXL   7.50%\r\n"), Some(7.5));
        assert_eq!(parse_flex_load("noise FXL 12.34% noise"), Some(12.34));
    }

    #[test]
    fn rejects_malformed_replies() {
        assert_eq!(parse_flex_load(""), None);
        assert_eq!(parse_flex_load("FXL"), None);
        assert_eq!(parse_flex_load("FXL100.00%"), None);
        assert_eq!(parse_flex_load("FXL .50%"), None);
        assert_eq!(parse_flex_load("FXL 1234.00%"), None);
        assert_eq!(parse_flex_load("FXL 12.3%"), None);
        assert_eq!(parse_flex_load("FXL 12.34"), None);
    }

    #[test]
    fn warning_is_debounced() {
        let mut monitor = LoadMonitor::with_interval(Duration::from_millis(50));
        assert!(monitor.observe("FXL 100.00%"));
        assert!(!monitor.observe("FXL 100.00%"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(monitor.observe("FXL 100.00%"));
    }

    #[test]
    fn partial_load_never_warns() {
        let mut monitor = LoadMonitor::with_interval(Duration::from_millis(1));
        assert!(!monitor.observe("FXL 99.99%"));
        assert!(!monitor.observe("garbage"));
    }
}
