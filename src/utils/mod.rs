pub mod sos;
pub mod sync_queue;

pub use sos::SignalOfStop;
pub use sync_queue::{Closed, Pop, SyncQueue};
