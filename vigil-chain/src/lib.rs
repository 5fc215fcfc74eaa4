//! Core Bitcoin data structures and wire serialization for the vigil
//! wallet service.
//!
//! This crate holds everything the rest of the workspace agrees on: the
//! consensus wire encodings, transaction identity, script-address
//! extraction, and the per-network parameter table.

#[macro_use]
extern crate serde;

pub mod amount;
pub mod cached;
pub mod compactint;
pub mod parameters;
pub mod serialization;
pub mod transaction;
pub mod transparent;

pub use amount::Amount;
pub use cached::Cached;
pub use compactint::CompactInt;
pub use parameters::Network;
pub use transaction::Transaction;
pub use serialization::{
    BitcoinDeserialize, BitcoinDeserializeInto, BitcoinSerialize, SerializationError,
};
