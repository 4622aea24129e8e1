#![doc = include_str!("../README.md")]

pub mod adapter;
pub mod channels;
pub mod guides;
pub mod mock;
pub mod pipeline;
pub mod runtime;
pub mod session;

pub use channels::ChannelSpec;
pub use pipeline::Denoiser;
pub use runtime::{Runtime, RuntimeConfig};
