// tdds-kernel: core runtime kernel for the TDDS middleware
//
// Hosts the subsystems every other crate builds on: the monotonic tick
// source and fractional wire time, fixed-size descriptor pools, the
// poll-based socket set, the ordered timer list with its callback-lock
// handshake, the leveled logger, and the worker event loop.

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod event;
pub mod log;
pub mod pool;
pub mod sock;
pub mod time;
pub mod timer;

pub use error::{DdsError, Result};
pub use time::{now_ftime, now_ticks, now_time, ticks_diff, FTime, Ticks, Time};

/// Convenience re-exports for downstream crates.
pub mod prelude {
    pub use crate::error::{DdsError, Result};
    pub use crate::event::{Dispatcher, EventFlags};
    pub use crate::pool::{Pool, PoolLimits};
    pub use crate::sock::{PollEvents, SocketSet};
    pub use crate::time::{now_ftime, now_ticks, now_time, ticks_diff, FTime, Ticks, Time};
    pub use crate::timer::{TimerId, TimerManager};
}
