pub mod browse;
pub mod health;
pub mod multipart;
pub mod stats;
pub mod upload;
