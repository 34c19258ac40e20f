pub mod analytics;
pub mod api;
pub mod auth;
pub mod cache;
pub mod click;
pub mod config;
pub mod models;
pub mod protection;
pub mod storage;
