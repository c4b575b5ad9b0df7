pub mod db;
pub mod error;
pub mod import;
pub mod matcher;
pub mod models;
pub mod normalize;
pub mod nutrition;
pub mod review;
pub mod service;
