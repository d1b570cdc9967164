pub mod client;
pub mod fetcher;
pub mod message;
pub mod source;
