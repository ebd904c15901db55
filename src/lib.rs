pub mod ads;
pub mod browser;
pub mod cache;
pub mod competitor;
pub mod config;
pub mod delivery;
pub mod discovery;
pub mod error;
pub mod extraction;
pub mod landing;
pub mod scoring;
pub mod stealth;
pub mod worker;
