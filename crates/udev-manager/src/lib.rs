pub mod adapters;
pub mod api;
pub mod app;
pub mod config;
pub mod discovery;
pub mod platform;
pub mod resource;
