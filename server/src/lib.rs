pub extern crate actix_web;

pub mod admin;
pub mod config;
pub mod connection;
pub mod document_file;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod identity;
pub mod memory_store;
pub mod persistence;
pub mod registry;
pub mod server;
pub mod session;
