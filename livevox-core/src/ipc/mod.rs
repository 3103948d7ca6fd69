//! Event types published to the host application.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a UI layer
//! can forward them without re-mapping.

pub mod events;
