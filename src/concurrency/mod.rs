mod deadline;
mod slot;

pub use deadline::{CancelReason, Deadline};
pub use slot::{SessionLease, SessionSlot, SlotState};
