//! AI Relay: chat bot front end for text-generation backends with a
//! single-worker priority scheduler.

pub mod backends;
pub mod bot;
pub mod channels;
pub mod config;
pub mod error;
pub mod roles;
pub mod sessions;
pub mod status;
pub mod worker;
