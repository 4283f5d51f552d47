pub mod config;
pub mod db;
pub mod move_node;
pub mod observability;
pub mod types;
