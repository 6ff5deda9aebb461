//! Small shared helpers: time source, token generation and shutdown handling.

pub mod clock;
pub mod shutdown;
pub mod token;

pub use clock::{Clock, ManualClock, SystemClock};
pub use shutdown::shutdown_signal;
pub use token::generate_token;
