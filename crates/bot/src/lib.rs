pub mod chat_bot;
pub mod commands;
pub mod format;
pub mod nl_parser;
pub mod profile_cache;
pub mod resolver;
pub mod scheduler;
pub mod subscriptions;
pub mod transport;
