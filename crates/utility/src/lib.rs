pub mod config;
pub mod functions;
pub mod members;
pub mod streams;
