//! Infrastructure layer: sentence framing and raw serial transport.
//! Everything here is oblivious to PBR command semantics.
pub mod codec;
pub mod serial;
