use crate::{
	clock::{Clock, SystemClock},
	config::Config,
	error::{BoxError, Error},
	tasks::{Outcome, Task, TaskHandle, TaskId, TaskStep},
	timers::{TimerHeap, WakeCondition},
};
use log::{debug, trace, warn};
use std::{
	cell::{Cell, RefCell},
	collections,
	future::Future,
	mem,
	rc::Rc,
	sync::{self, atomic, mpsc},
	time,
};

/// Messages delivered to the loop through its wake channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
	/// A task's waker fired
	Wake(TaskId),
	/// A handle requested cancellation
	Cancel(TaskId),
	/// Interrupts an idle wait, the stop flag carries the request
	Stop,
}

/// Lifecycle of an [`EventLoop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
	/// Created, never run
	Idle,
	/// Inside `run_until_complete` or `run_forever`
	Running,
	/// A run returned, the loop may run again
	Stopped,
	/// Torn down by [`EventLoop::close`]
	Closed,
}

/// What one scheduler iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
	/// Resumed the task
	Resumed(TaskId),
	/// Nothing was ready; waited for a timer or a wake-up
	Idled,
	/// No ready task, no timer and no live task left
	Quiescent,
}

/// Task creation state shared by the loop and its [`Spawner`]s
struct Shared {
	next_id: Cell<u64>,
	/// created tasks not yet on the ready queue
	inbox: RefCell<collections::VecDeque<Task>>,
	closed: Cell<bool>,
	events: mpsc::Sender<Event>,
}

/// Creates tasks on its loop from inside running tasks
#[derive(Clone)]
pub struct Spawner {
	shared: Rc<Shared>,
}

impl Spawner {
	/// Same as [`EventLoop::create_task`]; the task becomes ready on the loop's next iteration
	pub fn spawn<T, E, F>(&self, fut: F) -> Result<TaskHandle<T>, Error>
	where
		T: 'static,
		E: Into<BoxError>,
		F: Future<Output = Result<T, E>> + 'static,
	{
		if self.shared.closed.get() {
			return Err(Error::LoopClosed);
		}

		let id = TaskId::from_raw(self.shared.next_id.get());
		self.shared.next_id.set(self.shared.next_id.get() + 1);

		let (task, handle) = Task::create(id, fut, self.shared.events.clone());
		self.shared.inbox.borrow_mut().push_back(task);

		debug!("{} created", id);
		Ok(handle)
	}
}

/// Thread-safe handle that stops its loop, interrupting an idle wait
#[derive(Debug, Clone)]
pub struct LoopHandle {
	events: mpsc::Sender<Event>,
	stopping: sync::Arc<atomic::AtomicBool>,
}

impl LoopHandle {
	/// Requests the current (or next) run to exit after its current iteration
	pub fn stop(&self) {
		self.stopping.store(true, atomic::Ordering::SeqCst);
		let _ = self.events.send(Event::Stop);
	}

	/// True while a stop request is pending
	pub fn is_stopping(&self) -> bool {
		self.stopping.load(atomic::Ordering::SeqCst)
	}
}

/// A minimal single-threaded cooperative event loop
pub struct EventLoop<C: Clock = SystemClock> {
	clock: C,
	config: Config,
	state: LoopState,

	/// Live tasks, finished ones are released right away
	tasks: collections::BTreeMap<TaskId, Task>,

	/// Tasks to resume, each at most once
	ready: collections::VecDeque<TaskId>,

	/// Suspended tasks waiting on a deadline
	timers: TimerHeap,

	shared: Rc<Shared>,

	/// Wake-ups coming from wakers, handles and other threads
	queue: mpsc::Receiver<Event>,

	stopping: sync::Arc<atomic::AtomicBool>,
}

impl EventLoop<SystemClock> {
	/// Instantiate a new loop on the wall clock
	pub fn new() -> Self {
		Self::with_clock(SystemClock::new())
	}
}

impl Default for EventLoop<SystemClock> {
	fn default() -> Self {
		Self::new()
	}
}

impl<C: Clock> EventLoop<C> {
	/// Instantiate a new loop driven by `clock`
	pub fn with_clock(clock: C) -> Self {
		Self::with_config(clock, Config::default())
	}

	/// Instantiate a new loop driven by `clock`, tuned by `config`
	pub fn with_config(clock: C, config: Config) -> Self {
		let (events, queue) = mpsc::channel();
		let shared = Rc::new(Shared {
			next_id: Cell::new(0),
			inbox: RefCell::new(collections::VecDeque::new()),
			closed: Cell::new(false),
			events,
		});

		Self {
			clock,
			config,
			state: LoopState::Idle,
			tasks: collections::BTreeMap::new(),
			ready: collections::VecDeque::new(),
			timers: TimerHeap::new(),
			shared,
			queue,
			stopping: sync::Arc::new(atomic::AtomicBool::new(false)),
		}
	}

	/// Wraps `fut` in a task and queues it. It first runs once the loop runs.
	pub fn create_task<T, E, F>(&mut self, fut: F) -> Result<TaskHandle<T>, Error>
	where
		T: 'static,
		E: Into<BoxError>,
		F: Future<Output = Result<T, E>> + 'static,
	{
		self.ensure_open()?;

		let handle = self.spawner().spawn(fut)?;
		self.admit();
		Ok(handle)
	}

	/// Runs the loop until `fut` completes and returns its result.
	///
	/// `fut` may be a [`TaskHandle`] of a task created earlier. Other tasks are
	/// advanced along the way but not waited for; their pending timers are left as they are.
	pub fn run_until_complete<T, E, F>(&mut self, fut: F) -> Result<T, Error>
	where
		T: 'static,
		E: Into<BoxError>,
		F: Future<Output = Result<T, E>> + 'static,
	{
		self.ensure_idle()?;

		let main = self.create_task(fut)?;
		debug!("running until {} completes", main.id());

		self.run_until(|| main.is_finished());
		main.take_result().unwrap_or(Err(Error::InvalidState("event loop stopped before the future completed")))
	}

	/// Runs the loop until [`stop`](EventLoop::stop) is requested, or until no task is left
	pub fn run_forever(&mut self) -> Result<(), Error> {
		self.ensure_idle()?;
		self.run_until(|| false);
		Ok(())
	}

	/// Runs a single scheduler iteration: resumes one ready task, or waits for the next wake-up
	pub fn run_once(&mut self) -> Result<Turn, Error> {
		self.ensure_open()?;
		Ok(self.turn())
	}

	/// Requests the current (or next) run to exit after its current iteration. Idempotent.
	pub fn stop(&self) {
		self.handle().stop();
	}

	/// Requests cooperative cancellation of the task, see [`TaskHandle::cancel`].
	/// Its pending timer is removed right away.
	pub fn cancel<T>(&mut self, handle: &TaskHandle<T>) -> bool {
		self.cancel_task(handle.id())
	}

	/// Releases every task, timer and queued wake-up. Unfinished tasks end `Cancelled`
	/// and every later operation fails with [`Error::LoopClosed`]. Idempotent.
	pub fn close(&mut self) {
		if self.state == LoopState::Closed {
			return;
		}

		self.admit();
		self.shared.closed.set(true);

		if !self.tasks.is_empty() {
			warn!("closing event loop with {} unfinished tasks", self.tasks.len());
		}

		for (_, task) in mem::take(&mut self.tasks) {
			task.header.finish(Outcome::Cancelled);
		}

		self.ready.clear();
		self.timers.clear();
		while self.queue.try_recv().is_ok() {}

		self.state = LoopState::Closed;
		debug!("event loop closed");
	}

	/// Handle for stopping the loop from tasks or other threads
	pub fn handle(&self) -> LoopHandle {
		LoopHandle { events: self.shared.events.clone(), stopping: self.stopping.clone() }
	}

	/// Handle for creating tasks from inside tasks
	pub fn spawner(&self) -> Spawner {
		Spawner { shared: self.shared.clone() }
	}

	/// Current lifecycle state
	pub fn state(&self) -> LoopState {
		self.state
	}

	/// True while inside a run
	pub fn is_running(&self) -> bool {
		self.state == LoopState::Running
	}

	/// True once [`close`](EventLoop::close) ran
	pub fn is_closed(&self) -> bool {
		self.state == LoopState::Closed
	}

	/// Number of unfinished tasks
	pub fn task_count(&self) -> usize {
		self.tasks.len() + self.shared.inbox.borrow().len()
	}

	/// Number of live timers
	pub fn pending_timers(&self) -> usize {
		self.timers.len()
	}

	/// Number of tasks waiting for their turn
	pub fn ready_len(&self) -> usize {
		self.ready.len()
	}

	/// The loop's clock
	pub fn clock(&self) -> &C {
		&self.clock
	}

	/// The loop's configuration
	pub fn config(&self) -> &Config {
		&self.config
	}

	fn ensure_open(&self) -> Result<(), Error> {
		match self.state {
			LoopState::Closed => Err(Error::LoopClosed),
			_ => Ok(()),
		}
	}

	fn ensure_idle(&self) -> Result<(), Error> {
		match self.state {
			LoopState::Closed => Err(Error::LoopClosed),
			LoopState::Running => Err(Error::InvalidState("event loop is already running")),
			LoopState::Idle | LoopState::Stopped => Ok(()),
		}
	}

	/// Main loop, exits once `done`, on a stop request, or when nothing is left to do
	fn run_until(&mut self, mut done: impl FnMut() -> bool) {
		self.state = LoopState::Running;
		debug!("event loop running");

		loop {
			let turn = self.turn();

			if done() {
				break;
			}

			if self.stopping.swap(false, atomic::Ordering::SeqCst) {
				debug!("event loop stop requested");
				break;
			}

			if turn == Turn::Quiescent {
				debug!("event loop has no work left");
				break;
			}
		}

		self.stopping.store(false, atomic::Ordering::SeqCst);
		self.state = LoopState::Stopped;
	}

	fn turn(&mut self) -> Turn {
		self.admit();
		self.drain_events();
		self.fire_timers();

		if let Some(id) = self.ready.pop_front() {
			self.resume(id);
			return Turn::Resumed(id);
		}

		// don't block past a pending stop request
		if self.stopping.load(atomic::Ordering::SeqCst) {
			return Turn::Idled;
		}

		let timeout = match self.timers.peek_next_deadline() {
			Some(deadline) => Some(self.clock.idle_until(deadline)),
			None if self.tasks.is_empty() => return Turn::Quiescent,
			// only a waker can bring work now
			None => None,
		};

		self.wait(timeout);
		self.fire_timers();
		Turn::Idled
	}

	/// Blocks until an event arrives or `timeout` passes, then drains the channel
	fn wait(&mut self, timeout: Option<time::Duration>) {
		trace!("idle, waiting up to {:?}", timeout);

		let event = match timeout {
			Some(timeout) => self.queue.recv_timeout(timeout).ok(),
			None => self.queue.recv().ok(),
		};

		if let Some(event) = event {
			self.handle_event(event);
		}

		self.drain_events();
	}

	/// moves freshly created tasks onto the ready queue
	fn admit(&mut self) {
		for mut task in self.shared.inbox.take() {
			let id = task.id();
			task.queued = true;
			self.ready.push_back(id);
			self.tasks.insert(id, task);
		}
	}

	fn drain_events(&mut self) {
		while let Ok(event) = self.queue.try_recv() {
			self.handle_event(event);
		}
	}

	fn handle_event(&mut self, event: Event) {
		match event {
			Event::Wake(id) => self.wake(id),
			Event::Cancel(id) => {
				self.cancel_task(id);
			}
			Event::Stop => trace!("stop event received"),
		}
	}

	fn fire_timers(&mut self) {
		let now = self.clock.now();
		let expired: Vec<TaskId> = self.timers.pop_expired(now).collect();

		for id in expired {
			trace!("{} timer fired at {}", id, now);
			self.wake(id);
		}
	}

	/// Makes a suspended task ready, dropping the timer it waited on
	fn wake(&mut self, id: TaskId) {
		// finished or released
		let Some(task) = self.tasks.get_mut(&id) else {
			return;
		};

		if task.queued {
			return;
		}

		if let Some(timer) = task.timer.take() {
			self.timers.cancel(timer);
		}

		task.queued = true;
		self.ready.push_back(id);
	}

	fn cancel_task(&mut self, id: TaskId) -> bool {
		// spawned tasks may still sit in the inbox
		self.admit();

		let Some(task) = self.tasks.get_mut(&id) else {
			return false;
		};

		if task.cancel_pending || task.header.cancel_delivered() {
			return false;
		}

		debug!("{} cancellation requested", id);
		task.cancel_pending = true;

		if let Some(timer) = task.timer.take() {
			self.timers.cancel(timer);
		}

		if !task.queued {
			task.queued = true;
			self.ready.push_back(id);
		}

		true
	}

	fn resume(&mut self, id: TaskId) {
		let Some(task) = self.tasks.get_mut(&id) else {
			return;
		};

		task.queued = false;
		if let Some(timer) = task.timer.take() {
			self.timers.cancel(timer);
		}

		let started = self.clock.now();
		let step = task.resume(started);

		if let Some(threshold) = self.config.slow_step_threshold {
			let took = self.clock.now().saturating_duration_since(started);
			if took > threshold {
				warn!("{} ran for {:?} before suspending", id, took);
			}
		}

		match step {
			TaskStep::Suspend(Some(WakeCondition::Immediate)) => {
				trace!("{} yielded", id);
				task.queued = true;
				self.ready.push_back(id);
			}
			TaskStep::Suspend(Some(WakeCondition::After(dur))) => {
				let due = started + dur;
				trace!("{} sleeping until {}", id, due);
				task.timer = Some(self.timers.schedule(due, id));
			}
			TaskStep::Suspend(None) => trace!("{} waiting on its waker", id),
			TaskStep::Complete(outcome) => self.finish(id, outcome),
		}
	}

	fn finish(&mut self, id: TaskId, outcome: Outcome) {
		let Some(task) = self.tasks.remove(&id) else {
			return;
		};

		if let Some(timer) = task.timer {
			self.timers.cancel(timer);
		}

		match &outcome {
			Outcome::Done => debug!("{} done", id),
			Outcome::Failed(err) => debug!("{} failed: {}", id, err),
			Outcome::Cancelled => debug!("{} cancelled", id),
		}

		task.header.finish(outcome);
	}
}

impl<C: Clock> Drop for EventLoop<C> {
	fn drop(&mut self) {
		self.close();
	}
}
