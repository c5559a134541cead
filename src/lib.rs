#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod context;

/// [`Clock`](clock::Clock) sources and loop [`Time`](clock::Time)
pub mod clock;
/// [`Config`](config::Config) and its environment overrides
pub mod config;
/// [`Error`](error::Error) type shared by the loop and its tasks
pub mod error;
/// [`EventLoop`](rt::EventLoop) implementation
pub mod rt;
/// [`TaskHandle`](tasks::TaskHandle) (Join Handles) and task lifecycle types
pub mod tasks;
/// [`TimerHeap`](timers::TimerHeap) and the suspension primitives [`sleep`](timers::sleep) and [`yield_now`](timers::yield_now)
pub mod timers;

pub use clock::{Clock, ManualClock, SystemClock, Time};
pub use config::Config;
pub use error::{BoxError, Error};
pub use rt::{EventLoop, LoopHandle, LoopState, Spawner, Turn};
pub use tasks::{TaskHandle, TaskId, TaskState};
pub use timers::{WakeCondition, sleep, sleep_until, yield_now};
