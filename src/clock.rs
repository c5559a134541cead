use std::{fmt, ops, sync, time};

/// A point in loop time, in nanoseconds since the clock's epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(u64);

impl Time {
	/// The clock's epoch
	pub const ZERO: Time = Time(0);

	/// Creates a time from nanoseconds since the epoch
	pub const fn from_nanos(nanos: u64) -> Self {
		Self(nanos)
	}

	/// Creates a time from milliseconds since the epoch
	pub const fn from_millis(millis: u64) -> Self {
		Self(millis.saturating_mul(1_000_000))
	}

	/// Creates a time from seconds since the epoch
	pub const fn from_secs(secs: u64) -> Self {
		Self(secs.saturating_mul(1_000_000_000))
	}

	/// Nanoseconds since the epoch
	pub const fn as_nanos(self) -> u64 {
		self.0
	}

	/// Adds `dur`, clamping at the end of representable time
	pub fn saturating_add(self, dur: time::Duration) -> Self {
		let nanos = u64::try_from(dur.as_nanos()).unwrap_or(u64::MAX);
		Self(self.0.saturating_add(nanos))
	}

	/// Time elapsed from `earlier` to `self`, zero if `earlier` is later
	pub fn saturating_duration_since(self, earlier: Time) -> time::Duration {
		time::Duration::from_nanos(self.0.saturating_sub(earlier.0))
	}
}

impl ops::Add<time::Duration> for Time {
	type Output = Time;

	fn add(self, rhs: time::Duration) -> Self::Output {
		self.saturating_add(rhs)
	}
}

impl fmt::Display for Time {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?}", time::Duration::from_nanos(self.0))
	}
}

/// Monotonic time source driving an [`EventLoop`](crate::rt::EventLoop).
///
/// Implementations must never go backwards.
pub trait Clock {
	/// Current time
	fn now(&self) -> Time;

	/// Called when the loop has nothing to run before `deadline`.
	/// Returns how long the host thread should actually block waiting for wake-ups.
	fn idle_until(&self, deadline: Time) -> time::Duration {
		deadline.saturating_duration_since(self.now())
	}
}

/// Wall clock backed by [`Instant`](time::Instant), with its epoch at creation
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
	epoch: time::Instant,
}

impl SystemClock {
	/// Creates a clock whose epoch is now
	pub fn new() -> Self {
		Self { epoch: time::Instant::now() }
	}
}

impl Default for SystemClock {
	fn default() -> Self {
		Self::new()
	}
}

impl Clock for SystemClock {
	fn now(&self) -> Time {
		Time::from_nanos(u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX))
	}
}

/// Virtual clock for deterministic runs.
///
/// Time only moves when [`advance`](ManualClock::advance) is called, or when the loop
/// idles: idling jumps straight to the next deadline instead of blocking.
/// Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
	now: sync::Arc<sync::atomic::AtomicU64>,
}

impl ManualClock {
	/// Creates a clock at [`Time::ZERO`]
	pub fn new() -> Self {
		Self::default()
	}

	/// Creates a clock at `time`
	pub fn starting_at(time: Time) -> Self {
		Self { now: sync::Arc::new(sync::atomic::AtomicU64::new(time.as_nanos())) }
	}

	/// Moves time forward by `dur`
	pub fn advance(&self, dur: time::Duration) {
		let nanos = u64::try_from(dur.as_nanos()).unwrap_or(u64::MAX);
		let _ = self.now.fetch_update(sync::atomic::Ordering::AcqRel, sync::atomic::Ordering::Acquire, |now| {
			Some(now.saturating_add(nanos))
		});
	}

	/// Moves time forward to `time`, no-op if `time` already passed
	pub fn advance_to(&self, time: Time) {
		self.now.fetch_max(time.as_nanos(), sync::atomic::Ordering::AcqRel);
	}
}

impl Clock for ManualClock {
	fn now(&self) -> Time {
		Time::from_nanos(self.now.load(sync::atomic::Ordering::Acquire))
	}

	fn idle_until(&self, deadline: Time) -> time::Duration {
		self.advance_to(deadline);
		time::Duration::ZERO
	}
}

impl<C: Clock + ?Sized> Clock for sync::Arc<C> {
	fn now(&self) -> Time {
		(**self).now()
	}

	fn idle_until(&self, deadline: Time) -> time::Duration {
		(**self).idle_until(deadline)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn manual_clock_never_goes_backwards() {
		let clock = ManualClock::new();
		clock.advance(time::Duration::from_secs(2));
		clock.advance_to(Time::from_secs(1));
		assert_eq!(clock.now(), Time::from_secs(2));

		clock.advance_to(Time::from_secs(3));
		assert_eq!(clock.now(), Time::from_secs(3));
	}

	#[test]
	fn manual_clock_idles_by_jumping() {
		let clock = ManualClock::new();
		let shared = clock.clone();

		assert_eq!(clock.idle_until(Time::from_millis(250)), time::Duration::ZERO);
		assert_eq!(shared.now(), Time::from_millis(250));
	}

	#[test]
	fn system_clock_is_monotonic() {
		let clock = SystemClock::new();
		let a = clock.now();
		let b = clock.now();
		assert!(b >= a);
	}

	#[test]
	fn time_arithmetic_saturates() {
		let end = Time::from_nanos(u64::MAX);
		assert_eq!(end + time::Duration::from_secs(1), end);
		assert_eq!(Time::ZERO.saturating_duration_since(end), time::Duration::ZERO);
		assert_eq!(Time::from_secs(3).saturating_duration_since(Time::from_secs(1)), time::Duration::from_secs(2));
	}
}
