pub mod big_segments;
mod broadcaster;
pub mod config;
pub mod data_source;
mod data_system;
mod feature_requester;
mod flag;
mod http;
mod segment;
mod store;
pub mod stores;
mod test_common;
mod util;

pub use data_system::*;
pub use flag::*;
pub use http::{is_http_error_recoverable, RequestError};
pub use segment::*;
pub use store::*;
