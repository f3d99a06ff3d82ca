mod fs;
mod plurals;
mod time;

pub use fs::{files_below, relative_slash_path};
pub use plurals::pluralize;
pub use time::{millis_to_local_datetime, millis_to_seconds};
