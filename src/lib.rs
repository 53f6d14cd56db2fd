//! Fulcrum - OAuth 2.0 Device Authorization Grant server
//!
//! This library provides the device flow state machine and the HTTP surface
//! around it. It exposes all modules for testing purposes.

pub mod device;
pub mod entities;
pub mod errors;
pub mod identity;
pub mod jobs;
pub mod jwks;
pub mod pages;
pub mod settings;
pub mod storage;
pub mod tokens;
pub mod web;
