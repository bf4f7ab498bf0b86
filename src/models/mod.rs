pub mod contact;
pub mod day;
pub mod slot;
pub mod visit;

pub use contact::ContactData;
pub use day::{DayPeriod, DaySlot, TimeSlot};
pub use slot::{AvailabilityResponse, SlotSource, SlotStatus, VisitSlot};
pub use visit::{AgentContact, BookedInterval, Visit, VisitConfirmation, VisitRequest, VisitStatus};
