pub mod ai_utils;
pub mod api;
pub mod config;
pub mod course;
pub mod db;
pub mod error;
pub mod teacher;
pub mod tool;
pub mod user;
pub mod utils;
