//! Event records published on the supervisor's broadcast channels.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize`; payloads are
//! language-neutral structured records, so external subscribers (operator
//! UI bridge, read-only API) can forward them verbatim.

pub mod events;
