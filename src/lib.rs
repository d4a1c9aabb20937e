//! quidnode - uniform access to a CryptoNote-family blockchain
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Transaction Extra
//! - [`extra`] - Tagged sub-records of the transaction extra field
//! - [`payment_id`] - Payment id text <-> extra bytes
//!
//! ## Chain Access
//! - [`node`] - The `Node` trait, its events and both backends
//! - [`checkpoints`] - Compiled-in checkpoints consulted by the core
//!
//! ## Wallet Side
//! - [`wallet`] - Wallet handles bound to a node
//! - [`currency`] - Currency parameters and amount formatting
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Transaction Extra
// ============================================================================
pub mod extra;
pub mod payment_id;

// ============================================================================
// Chain Access
// ============================================================================
pub mod checkpoints;
pub mod node;

// ============================================================================
// Wallet Side
// ============================================================================
pub mod currency;
pub mod wallet;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;

pub use error::{NodeError, Result};
pub use node::{
    create_inprocess_node, create_node, create_rpc_node, event_channel, Node, NodeCallback,
    NodeEvent, NodeState,
};
pub use payment_id::PaymentId;
