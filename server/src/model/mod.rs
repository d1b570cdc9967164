pub mod cancellation_action;
pub mod candidate;
pub mod repository;
pub mod scan_session;
pub mod subscription;
pub mod user;
