pub mod ai_client;
pub mod context;
pub mod db;
pub mod error;
pub mod mutation;
pub mod resolver;
pub mod server;
pub mod session;
pub mod settings;
pub mod utils;
