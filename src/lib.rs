//! Gnostr Core Library
//!
//! Core functionality for Gnostr - a Nostr desktop client.
//! This crate keeps the user's identity, maintains connections to many
//! relays, validates and deduplicates what they deliver, and publishes
//! signed events. The presentation layer talks to [`GnostrCore`].

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![deny(unsafe_code)]

mod api;
pub mod archive;
pub mod config;
pub mod nostr;
pub mod publisher;
pub mod relay;
pub mod social;
pub mod store;
pub mod subscription;

pub use api::{CoreError, GnostrCore, GnostrCoreBuilder};
