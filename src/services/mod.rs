pub mod api;
pub mod availability;
pub mod calendar;
pub mod messaging;
pub mod scheduler;
pub mod wire_time;
