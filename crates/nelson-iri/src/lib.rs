//! # nelson-iri
//!
//! Client for the backing ledger process ("IRI").
//!
//! This crate provides:
//! - The JSON command RPC (`getNeighbors`/`addNeighbors`/`removeNeighbors`)
//! - Startup polling until the ledger is reachable
//! - Static-neighbor knowledge (neighbors configured before the daemon)
//! - A periodic health ticker with an event stream

mod client;
mod error;

pub use client::{IriClient, IriConfig, IriEvent, IriNeighbor, StaticNeighbor};
pub use error::{IriError, IriResult};
