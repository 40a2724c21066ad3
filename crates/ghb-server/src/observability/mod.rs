//! Logging and request tracking for the smart HTTP server.
//!
//! ```rust,ignore
//! use ghb_server::observability::{init_logging, request_id_layer, LogFormat};
//!
//! init_logging("info", LogFormat::Json);
//! let app = server.router().layer(request_id_layer());
//! ```

mod logging;
pub mod middleware;

pub use logging::{init_logging, LogFormat};
pub use middleware::{request_id_layer, MiddlewareLayer, RequestId, REQUEST_ID_HEADER};
