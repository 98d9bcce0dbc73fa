use rand::{rngs::StdRng, Rng, SeedableRng};

// Timer fires once the elapsed logical time reaches its timeout. Randomized
// timers draw a fresh timeout from [min, max] every time they are renewed so
// that replicas do not keep starting elections in lockstep.
pub struct Timer {
    elapsed: u64,
    timeout: u64,
    range: (u64, u64),
    rng: StdRng,
}

impl Timer {
    pub fn fixed(timeout: u64) -> Timer {
        Timer::randomized(timeout, timeout)
    }

    pub fn randomized(min: u64, max: u64) -> Timer {
        let mut timer = Timer {
            elapsed: 0,
            timeout: min,
            range: (min, max),
            rng: StdRng::from_entropy(),
        };
        timer.renew();
        timer
    }

    pub fn renew(&mut self) {
        self.elapsed = 0;
        self.timeout = self.rng.gen_range(self.range.0..=self.range.1);
    }

    // Advance the timer by `millis`. Returns true if it fired.
    pub fn advance(&mut self, millis: u64) -> bool {
        self.elapsed = self.elapsed.saturating_add(millis);
        self.elapsed >= self.timeout
    }

    pub fn timeout(&self) -> u64 {
        self.timeout
    }
}
