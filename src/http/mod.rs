//! HTTP server module for the forward-auth admission endpoint.
//!
//! A reverse proxy in front of the application forwards each protected
//! request's headers to `/admit/{route}` and passes or rejects the request
//! based on the status code returned.

mod server;

pub use server::{router, AppState, HttpServer};
