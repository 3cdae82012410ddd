//! Route handler modules for the relay REST API.

pub mod account;
pub mod devices;
pub mod health;
pub mod jars;
pub mod lookup;
pub mod messages;
