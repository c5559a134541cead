use crate::{
	clock::Time,
	context,
	error::Error,
	tasks::TaskId,
};
use std::{cmp, collections, future::Future, pin::Pin, task, time};

/// What a suspended task is waiting for before it can run again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCondition {
	/// Runnable again right away, behind every task already queued
	Immediate,
	/// Runnable again once the duration, measured from the start of the resume, has passed
	After(time::Duration),
}

impl WakeCondition {
	pub(crate) fn earliest(self, other: Self) -> Self {
		match (self, other) {
			(WakeCondition::After(a), WakeCondition::After(b)) => WakeCondition::After(a.min(b)),
			_ => WakeCondition::Immediate,
		}
	}
}

/// Identifies one scheduled wake-up inside a [`TimerHeap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// Keeps track of when a timer is due, and which task it wakes
#[derive(Debug, Clone, PartialEq, Eq)]
struct TimerEntry {
	due: Time,
	seq: u64,
	task: TaskId,
}

impl PartialOrd for TimerEntry {
	fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for TimerEntry {
	// reversed, `BinaryHeap` is a max-heap
	fn cmp(&self, other: &Self) -> cmp::Ordering {
		other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
	}
}

/// Min-heap of pending wake-ups, ordered by deadline then insertion order.
///
/// Cancelled entries stay in the heap as stale and are skipped when popped.
/// Only stale entries at the top are discarded, so a long sleep that keeps being
/// woken early leaves one stale entry per resume behind until its deadline comes up.
/// [`len`](TimerHeap::len) counts live timers only.
#[derive(Debug, Default)]
pub struct TimerHeap {
	heap: collections::BinaryHeap<TimerEntry>,
	live: collections::HashSet<u64>,
	next_seq: u64,
}

impl TimerHeap {
	/// Creates an empty heap
	pub fn new() -> Self {
		Self::default()
	}

	/// Number of live (non-cancelled) timers
	pub fn len(&self) -> usize {
		self.live.len()
	}

	/// True if no live timer remains
	pub fn is_empty(&self) -> bool {
		self.live.is_empty()
	}

	/// Schedules `task` to wake at `due`
	pub fn schedule(&mut self, due: Time, task: TaskId) -> TimerHandle {
		let seq = self.next_seq;
		self.next_seq += 1;

		self.heap.push(TimerEntry { due, seq, task });
		self.live.insert(seq);
		TimerHandle(seq)
	}

	/// Marks the timer as stale. Unknown or already fired handles are ignored.
	pub fn cancel(&mut self, handle: TimerHandle) {
		self.live.remove(&handle.0);
	}

	/// Earliest live deadline
	pub fn peek_next_deadline(&mut self) -> Option<Time> {
		self.prune();
		self.heap.peek().map(|entry| entry.due)
	}

	/// Removes every live timer due at or before `now`, yielding their tasks in
	/// deadline order. Timers left unconsumed when the iterator drops stay scheduled.
	pub fn pop_expired(&mut self, now: Time) -> PopExpired<'_> {
		PopExpired { heap: self, now }
	}

	/// Drops every timer
	pub fn clear(&mut self) {
		self.heap.clear();
		self.live.clear();
	}

	/// pop stale entries off the top
	fn prune(&mut self) {
		while let Some(entry) = self.heap.peek() {
			if self.live.contains(&entry.seq) {
				break;
			}
			self.heap.pop();
		}
	}
}

/// Iterator returned by [`TimerHeap::pop_expired`]
#[derive(Debug)]
pub struct PopExpired<'a> {
	heap: &'a mut TimerHeap,
	now: Time,
}

impl Iterator for PopExpired<'_> {
	type Item = TaskId;

	fn next(&mut self) -> Option<Self::Item> {
		self.heap.prune();

		if self.heap.heap.peek()?.due > self.now {
			return None;
		}

		let entry = self.heap.heap.pop()?;
		self.heap.live.remove(&entry.seq);
		Some(entry.task)
	}
}

/// Suspends the current task for `dur`.
///
/// A zero duration still yields once. Resolves to [`Error::Cancelled`] if the task is
/// cancelled while waiting.
pub fn sleep(dur: time::Duration) -> Sleep {
	Sleep { target: Target::After(dur), due: None }
}

/// Suspends the current task until loop time reaches `deadline`
pub fn sleep_until(deadline: Time) -> Sleep {
	Sleep { target: Target::At(deadline), due: None }
}

#[derive(Debug, Clone, Copy)]
enum Target {
	After(time::Duration),
	At(Time),
}

/// Future returned by [`sleep`] and [`sleep_until`]
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct Sleep {
	target: Target,
	due: Option<Time>,
}

impl Sleep {
	/// Deadline in loop time, known once first polled
	pub fn deadline(&self) -> Option<Time> {
		self.due
	}
}

impl Unpin for Sleep {}

impl Future for Sleep {
	type Output = Result<(), Error>;

	fn poll(mut self: Pin<&mut Self>, _cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
		let Some(frame) = context::current() else {
			return task::Poll::Ready(Err(Error::InvalidState("sleep polled outside of a running event loop")));
		};

		if frame.cancelled {
			return task::Poll::Ready(Err(Error::Cancelled));
		}

		let due = match self.due {
			Some(due) if frame.now >= due => return task::Poll::Ready(Ok(())),
			Some(due) => due,
			None => {
				let due = match self.target {
					Target::After(dur) => frame.now + dur,
					Target::At(at) => at,
				};
				self.due = Some(due);

				// already due on first poll, still give other tasks a turn
				if frame.now >= due {
					context::request(WakeCondition::Immediate);
					return task::Poll::Pending;
				}

				due
			}
		};

		context::request(WakeCondition::After(due.saturating_duration_since(frame.now)));
		task::Poll::Pending
	}
}

/// Gives every other ready task a turn before continuing
pub fn yield_now() -> YieldNow {
	YieldNow { yielded: false }
}

/// Future returned by [`yield_now`]
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
	yielded: bool,
}

impl Unpin for YieldNow {}

impl Future for YieldNow {
	type Output = Result<(), Error>;

	fn poll(mut self: Pin<&mut Self>, _cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
		let Some(frame) = context::current() else {
			return task::Poll::Ready(Err(Error::InvalidState("yield_now polled outside of a running event loop")));
		};

		if frame.cancelled {
			return task::Poll::Ready(Err(Error::Cancelled));
		}

		if self.yielded {
			return task::Poll::Ready(Ok(()));
		}

		self.yielded = true;
		context::request(WakeCondition::Immediate);
		task::Poll::Pending
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn id(n: u64) -> TaskId {
		TaskId::from_raw(n)
	}

	#[test]
	fn earliest_first() {
		let mut heap = TimerHeap::new();
		heap.schedule(Time::from_millis(100), id(1));
		heap.schedule(Time::from_millis(50), id(2));
		heap.schedule(Time::from_millis(150), id(3));

		assert_eq!(heap.peek_next_deadline(), Some(Time::from_millis(50)));

		let expired: Vec<_> = heap.pop_expired(Time::from_millis(100)).collect();
		assert_eq!(expired, vec![id(2), id(1)]);
		assert_eq!(heap.len(), 1);
		assert_eq!(heap.peek_next_deadline(), Some(Time::from_millis(150)));
	}

	#[test]
	fn equal_deadlines_fire_in_insertion_order() {
		let mut heap = TimerHeap::new();
		for n in [7, 3, 9, 1] {
			heap.schedule(Time::from_secs(1), id(n));
		}

		let expired: Vec<_> = heap.pop_expired(Time::from_secs(1)).collect();
		assert_eq!(expired, vec![id(7), id(3), id(9), id(1)]);
	}

	#[test]
	fn cancelled_timers_are_skipped() {
		let mut heap = TimerHeap::new();
		let first = heap.schedule(Time::from_secs(1), id(1));
		heap.schedule(Time::from_secs(2), id(2));

		heap.cancel(first);
		heap.cancel(first);
		assert_eq!(heap.len(), 1);
		assert_eq!(heap.peek_next_deadline(), Some(Time::from_secs(2)));

		let expired: Vec<_> = heap.pop_expired(Time::from_secs(5)).collect();
		assert_eq!(expired, vec![id(2)]);
		assert!(heap.is_empty());
		assert_eq!(heap.peek_next_deadline(), None);
	}

	#[test]
	fn cancelling_a_fired_timer_is_a_noop() {
		let mut heap = TimerHeap::new();
		let fired = heap.schedule(Time::from_secs(1), id(1));
		assert_eq!(heap.pop_expired(Time::from_secs(1)).count(), 1);

		let pending = heap.schedule(Time::from_secs(3), id(2));
		heap.cancel(fired);
		assert_eq!(heap.len(), 1);

		heap.cancel(pending);
		assert!(heap.is_empty());
	}

	#[test]
	fn unconsumed_expired_timers_stay_scheduled() {
		let mut heap = TimerHeap::new();
		heap.schedule(Time::from_secs(1), id(1));
		heap.schedule(Time::from_secs(2), id(2));

		assert_eq!(heap.pop_expired(Time::from_secs(2)).next(), Some(id(1)));
		assert_eq!(heap.len(), 1);
		assert_eq!(heap.pop_expired(Time::from_secs(2)).next(), Some(id(2)));
		assert_eq!(heap.pop_expired(Time::from_secs(2)).next(), None);
	}

	#[test]
	fn primitives_refuse_to_run_outside_a_loop() {
		let waker = futures::task::noop_waker();
		let mut cx = task::Context::from_waker(&waker);

		let mut nap = sleep(time::Duration::from_secs(1));
		assert!(matches!(Pin::new(&mut nap).poll(&mut cx), task::Poll::Ready(Err(Error::InvalidState(_)))));

		let mut turn = yield_now();
		assert!(matches!(Pin::new(&mut turn).poll(&mut cx), task::Poll::Ready(Err(Error::InvalidState(_)))));
	}

	#[test]
	fn sleep_requests_its_remaining_time() {
		let waker = futures::task::noop_waker();
		let mut cx = task::Context::from_waker(&waker);
		let mut nap = sleep(time::Duration::from_secs(3));

		let (poll, req) = context::enter(context::Frame::new(Time::from_secs(1), false), || Pin::new(&mut nap).poll(&mut cx));
		assert!(poll.is_pending());
		assert_eq!(req, Some(WakeCondition::After(time::Duration::from_secs(3))));
		assert_eq!(nap.deadline(), Some(Time::from_secs(4)));

		// early wake
		let (poll, req) = context::enter(context::Frame::new(Time::from_secs(2), false), || Pin::new(&mut nap).poll(&mut cx));
		assert!(poll.is_pending());
		assert_eq!(req, Some(WakeCondition::After(time::Duration::from_secs(2))));

		let (poll, _) = context::enter(context::Frame::new(Time::from_secs(4), false), || Pin::new(&mut nap).poll(&mut cx));
		assert!(matches!(poll, task::Poll::Ready(Ok(()))));
	}

	#[test]
	fn cancelled_sleep_reports_cancellation() {
		let waker = futures::task::noop_waker();
		let mut cx = task::Context::from_waker(&waker);
		let mut nap = sleep(time::Duration::from_secs(3));

		let _ = context::enter(context::Frame::new(Time::ZERO, false), || Pin::new(&mut nap).poll(&mut cx));
		let (poll, req) = context::enter(context::Frame::new(Time::from_secs(1), true), || Pin::new(&mut nap).poll(&mut cx));
		assert!(matches!(poll, task::Poll::Ready(Err(Error::Cancelled))));
		assert_eq!(req, None);
	}
}
