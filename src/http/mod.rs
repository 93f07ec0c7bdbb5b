//! HTTP surface: the admission middleware and the server that hosts it.

mod middleware;
pub mod response;
mod routes;
mod server;

pub use middleware::{AdmissionLayer, AdmissionService, HeaderPolicy};
pub use response::ErrorBody;
pub use routes::{router, StatusResponse};
pub use server::HttpServer;
