use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Process-wide counters shared by every index instance: the RAM-usage
/// accumulator and the cooperative interrupt flag. Wrapped in an explicit
/// `init`/`shutdown` lifecycle instead of loose statics.
pub struct Globals {
    ram_used: AtomicI64,
    interrupted: AtomicBool,
}

static GLOBALS: OnceLock<Globals> = OnceLock::new();

impl Globals {
    fn get() -> &'static Globals {
        GLOBALS.get_or_init(|| Globals {
            ram_used: AtomicI64::new(0),
            interrupted: AtomicBool::new(false),
        })
    }

    /// Idempotent; call once at process start
    pub fn init() {
        let _ = Self::get();
    }

    /// Reset counters; indexes must already be closed
    pub fn shutdown() {
        if let Some(globals) = GLOBALS.get() {
            globals.ram_used.store(0, Ordering::Relaxed);
            globals.interrupted.store(false, Ordering::Relaxed);
        }
    }

    /// Adjust the process-wide RAM counter by `delta` bytes and return the
    /// new total
    pub fn adjust_ram(delta: i64) -> i64 {
        Self::get().ram_used.fetch_add(delta, Ordering::Relaxed) + delta
    }

    pub fn ram_used() -> i64 {
        Self::get().ram_used.load(Ordering::Relaxed)
    }

    /// Request cooperative interruption of long operations (optimize,
    /// save, merge); polled at their safe points
    pub fn interrupt() {
        Self::get().interrupted.store(true, Ordering::Release);
    }

    pub fn clear_interrupt() {
        Self::get().interrupted.store(false, Ordering::Release);
    }

    pub fn is_interrupted() -> bool {
        Self::get().interrupted.load(Ordering::Acquire)
    }
}

/// Cloneable cooperative stop flag scoped to one operation (a single
/// optimize run or one query's worker set)
#[derive(Clone, Debug, Default)]
pub struct StopSignal(std::sync::Arc<AtomicBool>);

impl StopSignal {
    pub fn send(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire) || Globals::is_interrupted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_signal() {
        let signal = StopSignal::default();
        let other = signal.clone();
        assert!(!other.is_stopped());
        signal.send();
        assert!(other.is_stopped());
    }
}
