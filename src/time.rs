use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

/// Millisecond clock used to stamp shadow atlas allocations.
pub trait TickSource {
    fn now_ms(&self) -> u64;
}

/// Wall clock relative to construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemTicks {
    start: Instant,
}

impl SystemTicks {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemTicks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for SystemTicks {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Clock that only moves when told to. Clones share the same counter.
#[derive(Debug, Clone, Default)]
pub struct ManualTicks {
    now: Rc<Cell<u64>>,
}

impl ManualTicks {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Rc::new(Cell::new(start_ms)),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }

    pub fn set(&self, ms: u64) {
        self.now.set(ms);
    }
}

impl TickSource for ManualTicks {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_ticks_share_state_between_clones() {
        let ticks = ManualTicks::new(10);
        let observer = ticks.clone();
        ticks.advance(490);
        assert_eq!(observer.now_ms(), 500, "clones must observe advances");
    }
}
