//! Per-phase wall-clock measurement at the call site.

use std::fmt;
use std::time::Duration;

use quanta::Instant;

/// Records how long each phase of a run took.
///
/// Every lap is logged at `debug` as it ends. The measured call's result is
/// passed through untouched.
#[derive(Debug)]
pub struct PhaseTimer {
    start: Instant,
    last: Instant,
    laps: Vec<(&'static str, Duration)>,
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTimer {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last: now,
            laps: Vec::new(),
        }
    }

    /// Close the current lap under `name`.
    pub fn lap(&mut self, name: &'static str) -> Duration {
        let now = Instant::now();
        let elapsed = now - self.last;
        self.last = now;
        log::debug!("{} took {:?}", name, elapsed);
        self.laps.push((name, elapsed));
        elapsed
    }

    /// Run `f`, then close the current lap under `name`. The lap also
    /// covers whatever ran since the previous one, so laps always add up.
    pub fn time<T>(&mut self, name: &'static str, f: impl FnOnce() -> T) -> T {
        let ret = f();
        self.lap(name);
        ret
    }

    pub fn laps(&self) -> &[(&'static str, Duration)] {
        &self.laps
    }

    /// Time since the timer was created.
    pub fn total(&self) -> Duration {
        Instant::now() - self.start
    }
}

impl fmt::Display for PhaseTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, elapsed)) in self.laps.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} {:?}", name, elapsed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn laps_are_recorded_in_order() {
        let mut timer = PhaseTimer::new();
        let v = timer.time("first", || 7);
        assert_eq!(v, 7);
        timer.lap("second");

        let names: Vec<_> = timer.laps().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, ["first", "second"]);
        let sum: Duration = timer.laps().iter().map(|(_, d)| *d).sum();
        assert!(sum <= timer.total());
        assert!(timer.to_string().starts_with("first "));
    }

    #[test]
    fn time_between_laps_is_not_lost() {
        let mut timer = PhaseTimer::new();
        timer.lap("setup");
        std::thread::sleep(Duration::from_millis(30));
        timer.time("exchange", || ());

        let (name, exchange) = timer.laps()[1];
        assert_eq!(name, "exchange");
        assert!(exchange >= Duration::from_millis(30), "{:?}", exchange);
        let sum: Duration = timer.laps().iter().map(|(_, d)| *d).sum();
        assert!(timer.total() - sum < Duration::from_millis(30));
    }
}
