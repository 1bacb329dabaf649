use std::time::{Duration, Instant};

/// Frame clock. `Fixed` advances by a constant step, which keeps headless runs repeatable.
pub enum Time {
    Wall { start: Instant, last: Instant, delta: Duration },
    Fixed { step: Duration, elapsed: Duration, frame: u64 },
}

impl Time {
    pub fn new() -> Self {
        let now = Instant::now();
        Time::Wall { start: now, last: now, delta: Duration::ZERO }
    }

    pub fn fixed(step_seconds: f32) -> Self {
        Time::Fixed { step: Duration::from_secs_f32(step_seconds.max(0.0)), elapsed: Duration::ZERO, frame: 0 }
    }

    pub fn tick(&mut self) {
        match self {
            Time::Wall { last, delta, .. } => {
                let now = Instant::now();
                *delta = now - *last;
                *last = now;
            }
            Time::Fixed { step, elapsed, frame } => {
                *elapsed += *step;
                *frame += 1;
            }
        }
    }

    pub fn delta_seconds(&self) -> f32 {
        match self {
            Time::Wall { delta, .. } => delta.as_secs_f32(),
            Time::Fixed { step, .. } => step.as_secs_f32(),
        }
    }

    pub fn elapsed_seconds(&self) -> f32 {
        match self {
            Time::Wall { start, last, .. } => last.duration_since(*start).as_secs_f32(),
            Time::Fixed { elapsed, .. } => elapsed.as_secs_f32(),
        }
    }
}

impl Default for Time {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_advances_by_whole_steps() {
        let mut time = Time::fixed(0.25);
        for _ in 0..4 {
            time.tick();
        }
        assert_eq!(time.delta_seconds(), 0.25);
        assert!((time.elapsed_seconds() - 1.0).abs() < 1e-6);
    }
}
