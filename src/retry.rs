//! Bounded retries with a pressure-relief step between attempts.

/// Runs fallible operations up to a fixed number of times, invoking a
/// pressure-relief callback after every failed attempt.
///
/// The same `PressureRetry` is typically reused for every phase of one
/// allocation so that [`PressureRetry::did_retry`] reports whether any phase
/// needed help.
pub struct PressureRetry<F> {
    attempts: u32,
    relieve: F,
    did_retry: bool,
}

impl<F: FnMut()> PressureRetry<F> {
    /// Creates a retry helper making `attempts` attempts per operation.
    pub fn new(attempts: u32, relieve: F) -> PressureRetry<F> {
        assert!(attempts > 0);
        PressureRetry {
            attempts,
            relieve,
            did_retry: false,
        }
    }

    /// Runs `op` until it succeeds or the attempts are used up, returning the
    /// first success or the last error.
    pub fn run<T, E>(&mut self, mut op: impl FnMut() -> Result<T, E>) -> Result<T, E> {
        let mut attempt = 1;
        loop {
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            self.did_retry = true;
            log::debug!("allocation attempt {attempt} failed, relieving memory pressure");
            (self.relieve)();
            if attempt == self.attempts {
                return Err(err);
            }
            attempt += 1;
        }
    }

    /// Whether any operation run so far failed at least once.
    pub fn did_retry(&self) -> bool {
        self.did_retry
    }
}
