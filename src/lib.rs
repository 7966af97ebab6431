pub mod protocol;
pub mod server;
pub mod store;
pub mod web;
