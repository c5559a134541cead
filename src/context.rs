//! Per-resume frame shared between the scheduler and the suspension primitives.
//!
//! The frame only exists while the scheduler is polling a task, so primitives
//! reach the loop that is resuming them without any global loop instance.

use crate::{clock::Time, timers::WakeCondition};
use std::cell::Cell;

thread_local! {
	static CURRENT: Cell<Option<Frame>> = const { Cell::new(None) };
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
	/// Loop time when the resume started
	pub(crate) now: Time,
	/// Cancellation has been delivered to the task being resumed
	pub(crate) cancelled: bool,
	request: Option<WakeCondition>,
}

impl Frame {
	pub(crate) fn new(now: Time, cancelled: bool) -> Self {
		Self { now, cancelled, request: None }
	}
}

/// Restores the enclosing frame even if the body panics
struct Restore(Option<Frame>);

impl Drop for Restore {
	fn drop(&mut self) {
		CURRENT.with(|current| current.set(self.0));
	}
}

/// Runs `f` with `frame` installed, returning the wake condition requested during `f`
pub(crate) fn enter<R>(frame: Frame, f: impl FnOnce() -> R) -> (R, Option<WakeCondition>) {
	let restore = Restore(CURRENT.with(|current| current.replace(Some(frame))));
	let res = f();
	let request = CURRENT.with(|current| current.get()).and_then(|frame| frame.request);
	drop(restore);

	(res, request)
}

/// The frame of the task currently being resumed, if any
pub(crate) fn current() -> Option<Frame> {
	CURRENT.with(|current| current.get())
}

/// Asks the scheduler to wake the current task on `cond`.
/// Several requests in one resume merge into the earliest one.
pub(crate) fn request(cond: WakeCondition) {
	CURRENT.with(|current| {
		if let Some(mut frame) = current.get() {
			frame.request = Some(match frame.request {
				Some(prev) => prev.earliest(cond),
				None => cond,
			});
			current.set(Some(frame));
		}
	});
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[test]
	fn requests_merge_to_earliest() {
		let ((), req) = enter(Frame::new(Time::ZERO, false), || {
			request(WakeCondition::After(Duration::from_secs(2)));
			request(WakeCondition::After(Duration::from_secs(1)));
		});
		assert_eq!(req, Some(WakeCondition::After(Duration::from_secs(1))));

		let ((), req) = enter(Frame::new(Time::ZERO, false), || {
			request(WakeCondition::After(Duration::from_secs(1)));
			request(WakeCondition::Immediate);
		});
		assert_eq!(req, Some(WakeCondition::Immediate));
	}

	#[test]
	fn frame_only_lives_inside_enter() {
		assert!(current().is_none());
		let (seen, _) = enter(Frame::new(Time::from_secs(5), true), current);
		assert_eq!(seen.map(|f| (f.now, f.cancelled)), Some((Time::from_secs(5), true)));
		assert!(current().is_none());
	}
}
