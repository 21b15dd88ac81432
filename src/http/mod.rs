//! HTTP boundary: the admission middleware and the server hosting it.

mod middleware;
mod server;

pub use middleware::{admission_control, AdmissionState, DENIAL_MESSAGE, INTERNAL_ERROR_MESSAGE};
pub use server::{router, HttpServer};
