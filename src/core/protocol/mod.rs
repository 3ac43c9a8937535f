// src/core/protocol/mod.rs

pub mod resp;

pub use resp::{RespCodec, RespFrame};
