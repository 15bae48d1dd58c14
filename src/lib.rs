pub mod config;
pub mod db;
pub mod dispatch;
pub mod handlers;
pub mod media_group;
pub mod model;
pub mod reaper;
pub mod topics;
pub mod transport;
