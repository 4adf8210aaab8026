//
// beaverctl - Lunatico Beaver observatory dome controller driver
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Rain state persistence.
//!

use crate::dome::DomeError;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// How often the persistence side effect is attempted.
pub const RAIN_CHECK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum RainState {
    Raining,
    NotRaining,
    /// No sample persisted yet; guarantees the first sample is written.
    Unknown
}

/// Receives rain state changes, e.g. a status file watched by other programs.
pub trait RainStatusSink {
    fn persist(&mut self, state: RainState) -> Result<(), DomeError>;
}

/// Writes a human-readable `Raining:YES|NO` line to a file on every change.
pub struct RainStatusFile {
    path: PathBuf
}

impl RainStatusFile {
    pub fn new(path: PathBuf) -> RainStatusFile {
        RainStatusFile{ path }
    }
}

impl RainStatusSink for RainStatusFile {
    fn persist(&mut self, state: RainState) -> Result<(), DomeError> {
        let mut file = std::fs::File::create(&self.path)?;
        let value = if state == RainState::Raining { "YES" } else { "NO" };
        writeln!(file, "Raining:{}", value)?;
        Ok(())
    }
}

/// Discards rain state changes; used when persistence is disabled.
pub struct NullRainSink;

impl RainStatusSink for NullRainSink {
    fn persist(&mut self, _: RainState) -> Result<(), DomeError> { Ok(()) }
}

/// Injected so the interval gate can be tested without waiting.
pub trait Clock {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Gates and deduplicates rain state persistence.
///
/// The in-memory rain flag elsewhere is refreshed on every status read; only
/// the sink writes are interval-gated and edge-triggered.
pub struct RainMonitor {
    sink: Box<dyn RainStatusSink>,
    clock: Box<dyn Clock>,
    last_persisted: RainState,
    last_check: Instant
}

impl RainMonitor {
    pub fn new(sink: Box<dyn RainStatusSink>) -> RainMonitor {
        RainMonitor::with_clock(sink, Box::new(SystemClock))
    }

    pub fn with_clock(sink: Box<dyn RainStatusSink>, clock: Box<dyn Clock>) -> RainMonitor {
        let last_check = clock.now();
        RainMonitor{
            sink,
            clock,
            last_persisted: RainState::Unknown,
            last_check
        }
    }

    /// Whether the check interval has elapsed since the last persistence attempt.
    pub fn check_due(&self) -> bool {
        self.clock.now().duration_since(self.last_check) >= RAIN_CHECK_INTERVAL
    }

    pub fn restart_interval(&mut self) {
        self.last_check = self.clock.now();
    }

    /// Writes `state` to the sink only if it differs from the last write.
    pub fn persist_if_changed(&mut self, state: RainState) -> Result<(), DomeError> {
        if state == self.last_persisted { return Ok(()); }
        self.sink.persist(state)?;
        self.last_persisted = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct CountingSink {
        writes: Rc<RefCell<Vec<RainState>>>
    }

    impl RainStatusSink for CountingSink {
        fn persist(&mut self, state: RainState) -> Result<(), DomeError> {
            self.writes.borrow_mut().push(state);
            Ok(())
        }
    }

    #[test]
    fn given_repeated_samples_only_edges_are_persisted() {
        let writes = Rc::new(RefCell::new(vec![]));
        let mut monitor = RainMonitor::new(Box::new(CountingSink{ writes: Rc::clone(&writes) }));

        use RainState::*;
        for state in [NotRaining, NotRaining, Raining, Raining, NotRaining].iter() {
            monitor.persist_if_changed(*state).unwrap();
        }

        assert_eq!(vec![NotRaining, Raining, NotRaining], *writes.borrow());
    }

    #[test]
    fn given_advancing_clock_the_interval_gate_opens_and_closes() {
        struct TestClock {
            now: Rc<RefCell<Instant>>
        }

        impl Clock for TestClock {
            fn now(&self) -> Instant {
                *self.now.borrow()
            }
        }

        let now = Rc::new(RefCell::new(Instant::now()));
        let advance = |by: Duration| {
            let later = *now.borrow() + by;
            *now.borrow_mut() = later;
        };

        let mut monitor = RainMonitor::with_clock(
            Box::new(NullRainSink),
            Box::new(TestClock{ now: Rc::clone(&now) })
        );
        assert!(!monitor.check_due());

        advance(RAIN_CHECK_INTERVAL);
        assert!(monitor.check_due());

        monitor.restart_interval();
        assert!(!monitor.check_due());

        advance(RAIN_CHECK_INTERVAL - Duration::from_secs(1));
        assert!(!monitor.check_due());

        advance(Duration::from_secs(1));
        assert!(monitor.check_due());
    }

    #[test]
    fn given_failing_sink_last_persisted_state_is_unchanged() {
        struct FailingSink;
        impl RainStatusSink for FailingSink {
            fn persist(&mut self, _: RainState) -> Result<(), DomeError> {
                Err(DomeError::CommandFailed)
            }
        }

        let mut monitor = RainMonitor::new(Box::new(FailingSink));
        assert!(monitor.persist_if_changed(RainState::Raining).is_err());
        assert_eq!(RainState::Unknown, monitor.last_persisted);
    }
}
