//! Simulated time
//!
//! All durations inside the fabric are expressed in simulated seconds. A
//! [`Clock`] converts them to wall-clock delays by dividing by an acceleration
//! factor, which lets a ten-thousand-second workload run in ten wall seconds
//! (or instantly under tokio's paused test clock).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Sub};
use std::sync::Arc;
use std::time::Duration;

use crate::{HwError, Result};

/// Span of simulated time, in simulated seconds
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct SimDuration(f64);

impl SimDuration {
    /// Zero-length duration
    pub const ZERO: Self = Self(0.0);

    /// Create a duration from simulated seconds. Negative values clamp to zero.
    #[inline]
    #[must_use]
    pub fn from_secs_f64(secs: f64) -> Self {
        Self(secs.max(0.0))
    }

    /// Time needed to retire `instructions` at `instructions_per_second`
    #[must_use]
    pub fn for_work(instructions: u64, instructions_per_second: f64) -> Self {
        debug_assert!(instructions_per_second > 0.0);
        Self::from_secs_f64(instructions as f64 / instructions_per_second)
    }

    /// Simulated seconds
    #[inline]
    #[must_use]
    pub const fn as_secs_f64(self) -> f64 {
        self.0
    }

    /// Scale the duration by a non-negative factor
    #[inline]
    #[must_use]
    pub fn mul_f64(self, factor: f64) -> Self {
        Self::from_secs_f64(self.0 * factor)
    }
}

impl Add for SimDuration {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for SimDuration {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::from_secs_f64(self.0 - rhs.0)
    }
}

impl Mul<f64> for SimDuration {
    type Output = Self;
    fn mul(self, rhs: f64) -> Self {
        self.mul_f64(rhs)
    }
}

impl fmt::Display for SimDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.0)
    }
}

/// Point in simulated time, measured from the clock's origin
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct SimInstant(f64);

impl SimInstant {
    /// The clock origin
    pub const ORIGIN: Self = Self(0.0);

    /// Instant `secs` simulated seconds after the origin
    #[inline]
    #[must_use]
    pub fn from_secs_f64(secs: f64) -> Self {
        Self(secs.max(0.0))
    }

    /// Simulated seconds since the origin
    #[inline]
    #[must_use]
    pub const fn as_secs_f64(self) -> f64 {
        self.0
    }

    /// Duration elapsed since `earlier`, zero if `earlier` is later
    #[inline]
    #[must_use]
    pub fn saturating_duration_since(self, earlier: Self) -> SimDuration {
        SimDuration::from_secs_f64(self.0 - earlier.0)
    }
}

impl Add<SimDuration> for SimInstant {
    type Output = Self;
    fn add(self, rhs: SimDuration) -> Self {
        Self(self.0 + rhs.as_secs_f64())
    }
}

impl AddAssign<SimDuration> for SimInstant {
    fn add_assign(&mut self, rhs: SimDuration) {
        self.0 += rhs.as_secs_f64();
    }
}

impl Sub for SimInstant {
    type Output = SimDuration;
    fn sub(self, rhs: Self) -> SimDuration {
        self.saturating_duration_since(rhs)
    }
}

impl fmt::Display for SimInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t={:.3}s", self.0)
    }
}

/// Source of simulated time shared by every component of a fabric
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current simulated time
    fn now(&self) -> SimInstant;

    /// Wall-clock delay corresponding to a simulated duration
    fn to_wall(&self, duration: SimDuration) -> Duration;

    /// Simulated duration corresponding to a wall-clock delay
    fn to_sim(&self, duration: Duration) -> SimDuration;

    /// Future completing after `duration` of simulated time
    fn sleep(&self, duration: SimDuration) -> tokio::time::Sleep {
        tokio::time::sleep(self.to_wall(duration))
    }
}

/// Clock handle passed through constructors
pub type SharedClock = Arc<dyn Clock>;

/// Production clock: simulated time runs `acceleration` times faster than tokio time
///
/// Backed by `tokio::time::Instant`, so a runtime started with a paused clock
/// makes it fully deterministic.
#[derive(Debug, Clone)]
pub struct AcceleratedClock {
    origin: tokio::time::Instant,
    acceleration: f64,
}

impl AcceleratedClock {
    /// Create a clock whose origin is the current tokio instant
    pub fn new(acceleration: f64) -> Result<Self> {
        if !acceleration.is_finite() || acceleration <= 0.0 {
            return Err(HwError::InvalidConfig(format!(
                "acceleration must be a positive finite number, got {acceleration}"
            )));
        }
        Ok(Self {
            origin: tokio::time::Instant::now(),
            acceleration,
        })
    }

    /// Create a clock and wrap it for sharing
    pub fn shared(acceleration: f64) -> Result<SharedClock> {
        Ok(Arc::new(Self::new(acceleration)?))
    }

    /// Simulated seconds per wall second
    #[must_use]
    pub const fn acceleration(&self) -> f64 {
        self.acceleration
    }
}

impl Clock for AcceleratedClock {
    fn now(&self) -> SimInstant {
        SimInstant::from_secs_f64(self.origin.elapsed().as_secs_f64() * self.acceleration)
    }

    /// Saturates at [`Duration::MAX`]; tokio clamps such sleeps to its far future
    fn to_wall(&self, duration: SimDuration) -> Duration {
        Duration::try_from_secs_f64(duration.as_secs_f64() / self.acceleration)
            .unwrap_or(Duration::MAX)
    }

    fn to_sim(&self, duration: Duration) -> SimDuration {
        SimDuration::from_secs_f64(duration.as_secs_f64() * self.acceleration)
    }
}
