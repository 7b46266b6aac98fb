pub mod caller;
pub mod request_id;

pub use caller::{Caller, CALLER_HEADER};
pub use request_id::request_id_middleware;
