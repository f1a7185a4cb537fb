pub mod arches;
pub mod auth;
pub mod cache;
pub mod client;
pub mod digest;
pub mod limit;
pub mod lookup;
pub mod mem;
pub mod push;
pub mod reference;
pub mod spec;
pub mod synthesize;

pub use client::{Clients, Contextual, Error, ObjectReader, Registry};
pub use digest::Digest;
pub use reference::Reference;
