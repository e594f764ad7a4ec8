//! Single-sign-on bridge between a browser request pipeline and a local
//! Entra ID identity broker reached over native messaging.

pub mod accounts;
pub mod api;
pub mod config;
pub mod connectivity;
pub mod controller;
pub mod error;
pub mod events;
pub mod framing;
pub mod graph;
pub mod host;
pub mod inject;
pub mod link;
pub mod manifest;
pub mod pending;
pub mod protocol;
