#![allow(unused)]

// Convention from https://serde.rs/conventions.html
mod encode;
mod decode;
mod error;
mod token;

pub use encode::{encode_to_raw, encode_to_string};
pub use decode::{decode_bytes, decode_str, DecodedType};
pub use error::{Error, Result};
