//! Group key agreement and authentication for membership operations
//!
//! This module provides:
//! - CLIQUES group Diffie-Hellman key agreement ([`cliques`])
//! - ASKE authenticated signature key exchange ([`aske`])
//! - The greet message, its types and its wire codec
//! - [`Greeting`], one membership operation in progress
//! - [`Greeter`], which starts and recognises operations

pub mod aske;
pub mod cliques;
mod context;
mod directory;
mod errors;
mod greet_type;
mod greeter;
mod greeting;
mod message;
mod metadata;
mod packet;
mod store;

pub use aske::{AskeMember, AskeMessage};
pub use cliques::{CliquesMember, CliquesMessage};
pub use context::GreetContext;
pub use directory::{MemoryDirectory, PubKeyDirectory};
pub use errors::{GreetError, GreetResult};
pub use greet_type::{GreetBit, GreetType, Operation};
pub use greeter::{determine_flow_type, Greeter};
pub use greeting::{
    merge_messages, Completion, Finished, GreetOutcome, Greeting, GreetingHandle, ProcessedMessage,
    SendItem,
};
pub use message::{GreetMessage, Nonce};
pub use metadata::{chain_hash, GreetingMetadata, GreetingSummary};
pub use packet::{
    decode_packet, encode_packet, packet_id, peek_packet, PacketPeek, PROTOCOL_VERSION,
};
pub use store::{GreetStore, GreetingState};
