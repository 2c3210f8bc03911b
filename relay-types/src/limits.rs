//! Frame size caps enforced by the codec.

/// Default cap for one STREAM_CHUNK body: 256 KiB.
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 256 * 1024;

/// Default cap for one REQUEST/RESPONSE body: 8 MiB.
pub const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Negotiated maximum sizes for binary frame bodies.
///
/// Both sides enforce the caps at decode time; the connector additionally
/// splits upstream chunks at `max_chunk_bytes` before framing so a
/// well-behaved peer never produces an oversized frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Maximum decoded size of a single STREAM_CHUNK body.
    pub max_chunk_bytes: usize,
    /// Maximum decoded size of a REQUEST or RESPONSE body.
    pub max_body_bytes: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}
