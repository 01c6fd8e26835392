pub mod ai_api;
pub mod circuit_breaker;
pub mod database;
pub mod errors;
pub mod kv;
pub mod schedule_api;
pub mod schedule_scraper;
pub mod schedule_service;
pub mod types;
pub mod youtube_api;
