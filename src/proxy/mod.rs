pub mod context;
pub mod forwarder;
mod handler;

pub use context::BoxBody;
pub use forwarder::{
    is_retryable, ForwardError, ForwardRequest, ForwardedResponse, RequestForwarder, Stage,
};
pub use handler::{handle_request, parse_resource_path, resolve_trace_id};
