pub mod allocator;
pub mod batch;
pub mod control;
pub mod database;
pub mod keys;
pub mod netlink;
pub mod reconcile;
pub mod render;
pub mod service;
pub mod settings;
pub mod traits;
pub mod utils;
