//! Protocol layer: the PBR* command driver and the worker-thread proxy
//! that serializes access to it.
pub mod device;
pub mod proxy;
