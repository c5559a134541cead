use crate::{
	clock::Time,
	context,
	error::{BoxError, Error},
	rt::Event,
	timers::{TimerHandle, WakeCondition},
};
use std::{
	cell::{Cell, RefCell},
	fmt,
	future::Future,
	pin::Pin,
	rc::Rc,
	sync::{self, mpsc},
	task,
};

/// Opaque task identity, increasing in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
	pub(crate) const fn from_raw(raw: u64) -> Self {
		Self(raw)
	}
}

impl fmt::Display for TaskId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "task#{}", self.0)
	}
}

/// Lifecycle of a task.
///
/// `Pending → Running → (Suspended → Running)* → Done | Cancelled | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
	/// Created, never resumed.
	///
	/// A task cancelled before its first resume, or released by
	/// [`EventLoop::close`](crate::rt::EventLoop::close), goes straight to `Cancelled`
	/// without ever running.
	Pending,
	/// Being resumed right now
	Running,
	/// Waiting for a timer, a cooperative turn, or its waker
	Suspended,
	/// Finished with a value
	Done,
	/// Finished after observing cancellation, or by unwinding with [`Error::Cancelled`]
	Cancelled,
	/// Finished with an error
	Failed,
}

impl TaskState {
	/// True for `Done`, `Cancelled` and `Failed`
	pub fn is_terminal(self) -> bool {
		matches!(self, TaskState::Done | TaskState::Cancelled | TaskState::Failed)
	}
}

/// Terminal outcome of a resume
#[derive(Debug, Clone)]
pub enum Outcome {
	/// Body returned a value
	Done,
	/// Body returned an error
	Failed(Error),
	/// Body unwound after cancellation
	Cancelled,
}

/// Result of advancing a task by one resume
#[derive(Debug, Clone)]
pub enum TaskStep {
	/// Task suspended. `None` means it waits on its waker
	Suspend(Option<WakeCondition>),
	/// Task reached a terminal state
	Complete(Outcome),
}

/// State shared between the scheduler's [`Task`] and every [`TaskHandle`]
pub(crate) struct TaskHeader {
	id: TaskId,
	state: Cell<TaskState>,
	error: RefCell<Option<Error>>,
	cancel_delivered: Cell<bool>,
	joiners: RefCell<Vec<task::Waker>>,
}

impl TaskHeader {
	pub(crate) fn state(&self) -> TaskState {
		self.state.get()
	}

	pub(crate) fn cancel_delivered(&self) -> bool {
		self.cancel_delivered.get()
	}

	/// Writes the terminal state and wakes joiners. Terminal states are never left.
	pub(crate) fn finish(&self, outcome: Outcome) {
		if self.state().is_terminal() {
			return;
		}

		let state = match outcome {
			Outcome::Done => TaskState::Done,
			Outcome::Failed(err) => {
				*self.error.borrow_mut() = Some(err);
				TaskState::Failed
			}
			Outcome::Cancelled => {
				*self.error.borrow_mut() = Some(Error::Cancelled);
				TaskState::Cancelled
			}
		};

		self.state.set(state);
		for waker in self.joiners.take() {
			waker.wake();
		}
	}
}

type Body = Pin<Box<dyn Future<Output = Result<(), Error>>>>;

/// A task as owned by the scheduler
pub(crate) struct Task {
	pub(crate) header: Rc<TaskHeader>,
	body: Option<Body>,
	waker: task::Waker,
	/// Timer the task is currently waiting on
	pub(crate) timer: Option<TimerHandle>,
	/// Task id is in the ready queue
	pub(crate) queued: bool,
	/// Cancellation requested, not yet delivered
	pub(crate) cancel_pending: bool,
}

impl Task {
	/// Wraps `fut` as a `Pending` task; its value travels to the returned handle
	pub(crate) fn create<T, E, F>(id: TaskId, fut: F, events: mpsc::Sender<Event>) -> (Task, TaskHandle<T>)
	where
		T: 'static,
		E: Into<BoxError>,
		F: Future<Output = Result<T, E>> + 'static,
	{
		let (value_tx, value_rx) = oneshot::channel();

		let header = Rc::new(TaskHeader {
			id,
			state: Cell::new(TaskState::Pending),
			error: RefCell::new(None),
			cancel_delivered: Cell::new(false),
			joiners: RefCell::new(Vec::new()),
		});

		let body: Body = Box::pin(async move {
			let value = fut.await.map_err(Error::from_body)?;
			// the handle may be gone already
			let _ = value_tx.send(value);
			Ok::<(), Error>(())
		});

		let waker = task::Waker::from(sync::Arc::new(TaskWaker { id, events: events.clone() }));
		let task = Task { header: header.clone(), body: Some(body), waker, timer: None, queued: false, cancel_pending: false };
		let handle = TaskHandle { header, value_rx, events };

		(task, handle)
	}

	pub(crate) fn id(&self) -> TaskId {
		self.header.id
	}

	/// Advances the body to its next suspension point or to a terminal outcome.
	/// A pending cancellation is delivered by this resume.
	pub(crate) fn resume(&mut self, now: Time) -> TaskStep {
		if self.cancel_pending {
			self.cancel_pending = false;
			self.header.cancel_delivered.set(true);

			// never started, nothing to unwind
			if self.header.state() == TaskState::Pending {
				self.body = None;
				return TaskStep::Complete(Outcome::Cancelled);
			}
		}

		let cancelled = self.header.cancel_delivered.get();
		let Some(body) = self.body.as_mut() else {
			return TaskStep::Complete(Outcome::Cancelled);
		};

		self.header.state.set(TaskState::Running);
		let mut cx = task::Context::from_waker(&self.waker);
		let (poll, request) = context::enter(context::Frame::new(now, cancelled), || body.as_mut().poll(&mut cx));

		let outcome = match poll {
			task::Poll::Pending if !cancelled => {
				self.header.state.set(TaskState::Suspended);
				return TaskStep::Suspend(request);
			}
			// ignored the cancellation, dropping the body unwinds it
			task::Poll::Pending => Outcome::Cancelled,
			task::Poll::Ready(_) if cancelled => Outcome::Cancelled,
			task::Poll::Ready(Ok(())) => Outcome::Done,
			// unwound from a cancellation it observed, e.g. a cancelled join
			task::Poll::Ready(Err(Error::Cancelled)) => Outcome::Cancelled,
			task::Poll::Ready(Err(err)) => Outcome::Failed(err),
		};

		self.body = None;
		TaskStep::Complete(outcome)
	}
}

/// Queues its task on the loop through the wake channel, from any thread
struct TaskWaker {
	id: TaskId,
	events: mpsc::Sender<Event>,
}

impl task::Wake for TaskWaker {
	fn wake(self: sync::Arc<Self>) {
		self.wake_by_ref()
	}

	fn wake_by_ref(self: &sync::Arc<Self>) {
		// loop is gone, nothing left to wake
		let _ = self.events.send(Event::Wake(self.id));
	}
}

/// Handle to a task created on an [`EventLoop`](crate::rt::EventLoop).
///
/// Reads the task's state and result, and requests cancellation. Awaiting the handle
/// from another task resolves to the task's result.
pub struct TaskHandle<T> {
	header: Rc<TaskHeader>,
	value_rx: oneshot::Receiver<T>,
	events: mpsc::Sender<Event>,
}

impl<T> TaskHandle<T> {
	/// Task identity
	pub fn id(&self) -> TaskId {
		self.header.id
	}

	/// Current state
	pub fn state(&self) -> TaskState {
		self.header.state()
	}

	/// True once the task reached a terminal state
	pub fn is_finished(&self) -> bool {
		self.state().is_terminal()
	}

	/// True if the task ended in [`TaskState::Cancelled`]
	pub fn is_cancelled(&self) -> bool {
		self.state() == TaskState::Cancelled
	}

	/// Error of a `Failed` or `Cancelled` task
	pub fn error(&self) -> Option<Error> {
		self.header.error.borrow().clone()
	}

	/// Requests cooperative cancellation, delivered on the task's next resume.
	/// Returns false if the task already finished. Repeated requests are no-ops.
	pub fn cancel(&self) -> bool {
		if self.is_finished() {
			return false;
		}

		let _ = self.events.send(Event::Cancel(self.id()));
		true
	}

	/// Takes the result of a finished task, `None` while it runs.
	///
	/// The value of a `Done` task can be taken once, later calls return
	/// [`Error::InvalidState`]. Errors can be read any number of times.
	pub fn take_result(&self) -> Option<Result<T, Error>> {
		match self.state() {
			TaskState::Done => match self.value_rx.try_recv() {
				Ok(value) => Some(Ok(value)),
				Err(oneshot::TryRecvError::Disconnected) => Some(Err(Error::InvalidState("task result already taken"))),
				Err(oneshot::TryRecvError::Empty) => None,
			},
			TaskState::Failed | TaskState::Cancelled => Some(Err(self.error().unwrap_or(Error::Cancelled))),
			TaskState::Pending | TaskState::Running | TaskState::Suspended => None,
		}
	}
}

impl<T> fmt::Debug for TaskHandle<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TaskHandle").field("id", &self.id()).field("state", &self.state()).finish()
	}
}

impl<T> Unpin for TaskHandle<T> {}

impl<T> Future for TaskHandle<T> {
	type Output = Result<T, Error>;

	fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
		if let Some(res) = self.take_result() {
			return task::Poll::Ready(res);
		}

		// the joining task itself was cancelled
		if context::current().is_some_and(|frame| frame.cancelled) {
			return task::Poll::Ready(Err(Error::Cancelled));
		}

		let mut joiners = self.header.joiners.borrow_mut();
		if !joiners.iter().any(|w| w.will_wake(cx.waker())) {
			joiners.push(cx.waker().clone());
		}

		task::Poll::Pending
	}
}
