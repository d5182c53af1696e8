//! Core data models for the image gateway.
//!
//! These describe what the gateway hands out (locators) and what it accepts
//! (content type rules). Object bytes never live here; they stay in the store.

pub mod content_type;
pub mod image;
