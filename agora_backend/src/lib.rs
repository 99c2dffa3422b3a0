pub mod config;
pub mod database;
pub mod executor;
pub mod forum;
pub mod invoker;
pub mod scheduler;
pub mod tools;
