//! Engine context and frame timing

use std::time::{Duration, Instant};

use crate::{ConfigError, EngineConfig};

/// Frame timing since the clock started
#[derive(Debug, Clone)]
pub struct FrameClock {
    start: Instant,
    last_tick: Instant,
    frame_number: u64,
    delta_time: f32,
    elapsed_time: f32,
}

impl FrameClock {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            frame_number: 0,
            delta_time: 0.0,
            elapsed_time: 0.0,
        }
    }

    /// Advance to the next frame, returning the seconds since the last tick
    pub fn tick(&mut self) -> f32 {
        let now = Instant::now();
        self.advance(now.duration_since(self.last_tick));
        self.last_tick = now;
        self.elapsed_time = now.duration_since(self.start).as_secs_f32();
        self.delta_time
    }

    /// Advance by a fixed step, for simulated frames
    pub fn advance(&mut self, delta: Duration) {
        self.delta_time = delta.as_secs_f32();
        self.elapsed_time += self.delta_time;
        self.frame_number += 1;
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Seconds between the last two ticks
    pub fn delta_time(&self) -> f32 {
        self.delta_time
    }

    /// Seconds since the clock started
    pub fn elapsed_time(&self) -> f32 {
        self.elapsed_time
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide state handed to the graphics system.
///
/// Created once at startup and passed by reference; there is no global
/// engine instance.
#[derive(Debug, Clone)]
pub struct EngineContext {
    config: EngineConfig,
    clock: FrameClock,
}

impl EngineContext {
    /// Validate `config` and start the frame clock
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        log::info!(
            "Engine context created: '{}' {}x{} ({:?})",
            config.title,
            config.width,
            config.height,
            config.backend
        );
        Ok(Self {
            config,
            clock: FrameClock::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut FrameClock {
        &mut self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_steps_accumulate() {
        let mut clock = FrameClock::new();
        clock.advance(Duration::from_millis(250));
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.frame_number(), 2);
        assert_eq!(clock.delta_time(), 0.25);
        assert_eq!(clock.elapsed_time(), 0.5);
    }

    #[test]
    fn test_tick_is_monotonic() {
        let mut clock = FrameClock::new();
        let dt = clock.tick();
        assert!(dt >= 0.0);
        assert!(clock.elapsed_time() >= dt);
        assert_eq!(clock.frame_number(), 1);
    }

    #[test]
    fn test_context_rejects_invalid_config() {
        let config = EngineConfig::default().with_frames_in_flight(0);
        assert!(matches!(
            EngineContext::new(config),
            Err(ConfigError::NoFramesInFlight)
        ));
    }
}
