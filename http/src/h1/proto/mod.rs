//! protocol module of http/1.x. aiming to be correct and fast with only
//! safe code.

pub mod buf_write;
pub mod codec;
pub mod context;
pub mod decode;
pub mod encode;
pub mod error;
