pub mod api;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod gateway;
pub mod jobs;
pub mod logging;
pub mod providers;
