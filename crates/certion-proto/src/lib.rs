//! Certion tunnel protocol
//!
//! Frame types exchanged between the relay and an agent over one tunnel
//! session, plus the binary codec used to put them on the wire.

pub mod codec;
pub mod frames;

pub use codec::{CodecError, FrameCodec};
pub use frames::{HeaderList, RequestId, TunnelFrame};

/// Protocol version announced in `Hello`
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum encoded frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest body chunk carried by a single frame
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Body chunks a peer may send per exchange before waiting for a `WindowUpdate`
pub const INITIAL_WINDOW: u32 = 16;
