//! Redis backend: RESP2 codec and per-node client.

pub mod client;
pub mod codec;

pub use client::{RedisNodeBus, RedisNodeBusFactory};
pub use codec::{RespCodec, RespFrame};
