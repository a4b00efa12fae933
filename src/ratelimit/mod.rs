//! Rate limiting algorithms and the limiter facade.

mod clock;
mod fixed;
mod key;
mod limiter;
mod sliding;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use fixed::{FixedWindow, FIXED_WINDOW_SCRIPT};
pub use key::RateLimitKey;
pub use limiter::RateLimiter;
pub use sliding::{SlidingWindow, SLIDING_WINDOW_SCRIPT};
pub use window::{HitResult, RawOutcome, WindowSpec};
