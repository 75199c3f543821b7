#![forbid(unsafe_code)]

// Roomcast library - signaling control plane and SFU orchestrator

pub mod admin;
pub mod auth;
pub mod clients;
pub mod config;
pub mod events;
pub mod ice;
pub mod media;
pub mod metrics;
pub mod recorder;
pub mod rooms;
pub mod signaling;
