pub mod browser;
pub mod chromium;
pub mod engine;
pub mod link;
pub mod monitor;
