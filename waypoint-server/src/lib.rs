pub mod agents;
pub mod app;
pub mod http;
pub mod router;
pub mod server;
pub mod workflows;
