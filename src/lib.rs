//! kingress: a reverse HTTP/HTTPS proxy configured from Kubernetes Ingress,
//! Service, Endpoints and Secret objects.

pub mod api;
pub mod apis;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod proxy;
