#![forbid(unsafe_code)]

pub mod auth;
pub mod authorizer;
pub mod connection;
pub mod errors;
pub mod health;
pub mod pipeline;
pub mod presence;
pub mod registry;
pub mod rooms;
pub mod service;
pub mod store;
pub mod typing;

#[cfg(test)]
mod pipeline_tests;


#[cfg(test)]
mod rooms_tests;
