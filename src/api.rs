//! HTTP surface: client-facing gateway routes plus operator-facing admin
//! routes, each bound to its own listener in `main.rs`.

pub mod admin;
pub mod admin_auth;
pub mod client;
pub mod health;
pub mod metrics;
pub mod request_id;
