//! Types published to the presentation layer.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them over whatever event bus it uses.

pub mod events;
