pub mod cancellation;
pub mod jobs;
pub mod registry;
pub mod scan;
pub mod service;
