#![doc = include_str!("../README.md")]

pub mod optix;
pub mod sys;

pub use optix::OptixBackend;
