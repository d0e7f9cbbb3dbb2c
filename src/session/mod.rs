//! Session persistence engine
//!
//! # Modules
//!
//! - `model`: the session and its attributes
//! - `serializer`: pluggable payload encodings and change fingerprints
//! - `context`: per-request session cache
//! - `id`: cluster-unique id reservation
//! - `policy`: persist policies
//! - `store`: find / create / save / remove orchestration

mod context;
mod id;
mod model;
mod policy;
mod serializer;
mod store;

pub use context::RequestContext;
pub use id::SessionIdAllocator;
pub use model::Session;
pub use policy::SessionPersistPolicy;
pub use serializer::{
    BincodeSerializer, JsonSerializer, SerializationMetadata, SerializerKind, SessionSerializer,
    StoredPayload,
};
pub use store::{SaveOutcome, SessionStore};
