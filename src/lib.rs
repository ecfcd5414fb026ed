//! Shared core for the stdio tool agents: a line-delimited JSON-RPC loop, a
//! static tool registry and the sandboxed path resolver that guards every
//! path-shaped argument before it reaches a backend.

pub mod backend;
pub mod config;
pub mod fs;
pub mod git;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod sandbox;
pub mod server;
