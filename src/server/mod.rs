pub mod command_dispatcher;
pub mod config;
pub mod core_services;
pub mod node_broadcaster;
pub mod reconciler;
pub mod registry;
