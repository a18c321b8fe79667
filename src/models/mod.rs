//! Domain models shared across the crawler, analysis pipeline and API.

mod change;
mod check;
mod resource;

pub use change::{Change, ChangeDetection, ChangePayload};
pub use check::{parse_http_date, Check, NewCheck};
pub use resource::{is_terminal, Resource, ResourceStatus};
