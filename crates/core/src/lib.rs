pub mod config;
pub mod event;
pub mod record;
pub mod session;

pub use config::Config;
pub use event::*;
pub use record::{EventPage, EventQuery, EventRecord, Pagination};
pub use session::*;
