//! Stream transport wire protocol.
//!
//! The stream transport delimits messages with a length prefix. The
//! WebSocket transport needs no framing of its own: one binary WebSocket
//! message carries one application message.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `frame` | Length-prefix codec, header width and byte order |

// ============================================================================
// Submodules
// ============================================================================

/// Length-prefixed frame codec.
pub mod frame;

// ============================================================================
// Re-exports
// ============================================================================

pub use frame::{ByteOrder, FrameCodec, HeaderWidth};
