//! Runtime side of the tag-stream browser plugin protocol: the codec for
//! `<name='value' ...>` wire tags, the shared-secret auth handshake, the
//! per-connection session loop, and the server/filter run modes.

pub mod secret;
pub mod serve;
pub mod session;
pub mod tag;
