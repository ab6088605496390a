//! Master-worker wire layer.
//!
//! - **protocol**: typed messages + positional token encode/decode
//! - **codec**: line framing as a tokio-util `Decoder`/`Encoder`
//! - **channel**: the named-pipe pair binding one slot to the master

pub mod channel;
pub mod codec;
pub mod protocol;
