#![doc = include_str!("../README.md")]

pub mod backend;
pub mod context;
pub mod device;
pub mod error;
pub mod ffi_types;
pub mod image;
