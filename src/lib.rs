pub mod cache;
pub mod clock;
pub mod config;
pub mod detector;
pub mod engine;
pub mod flow;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod profile;
pub mod scheduler;
pub mod session;
pub mod store;
