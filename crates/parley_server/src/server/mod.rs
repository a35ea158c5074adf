#![forbid(unsafe_code)]

pub mod commands;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod identity;
pub mod presence;
pub mod registry;
pub mod store;

#[cfg(test)]
mod commands_tests;
#[cfg(test)]
mod registry_tests;
