pub mod detector;
pub mod patterns;
pub mod rules;
