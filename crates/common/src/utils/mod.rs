mod headers;
mod id;
mod time;

pub use headers::{build_header_map, header_string, join_set_cookie};
pub use id::{generate_region_name, generate_request_id};
pub use time::current_timestamp_millis;
