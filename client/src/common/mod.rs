pub mod errors;
pub mod timeout_tracker;
pub mod work_item;

pub use errors::{HandlerError, MessagingError, MessagingResult};
pub use timeout_tracker::TimeoutTracker;
pub use work_item::{PendingReceive, ReplayableWorkItem, WorkItem};
