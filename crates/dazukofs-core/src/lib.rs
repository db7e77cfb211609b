mod engine;
mod error;
mod event;
mod group;
mod ignore;
mod mask;
mod pid;
mod sync;

pub use engine::{CancelFlag, ClaimedEvent, Engine};
pub use error::EngineError;
pub use event::{Access, Verdict};
pub use pid::Pid;

/// Highest number of concurrently registered (non-deprecated) groups. Group
/// ids are always in `[0, GROUP_MAX)`, so a device host can create one node
/// per possible id up front.
pub const GROUP_MAX: usize = 10;

/// Bytes allowed in a group name.
pub fn is_group_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'-'
}
