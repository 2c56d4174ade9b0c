pub mod accounts;
pub mod app;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod normalize;
pub mod response;
pub mod upstream;
