pub mod config;
pub mod error;
pub mod multiplexer;
pub mod packet;
pub mod pipe;
pub mod socket;
pub mod stream_pos;
pub mod wire;
