/// Version byte leading every packet.
pub const WIRE_VERSION: u8 = 1;

/// Number of ordering channels a transport exposes (channels `0..32`).
pub const MAX_ORDERING_CHANNELS: u8 = 32;

/// Largest accepted JSON header (16 MiB). Manifests ride in headers, so
/// this bounds the size of a download request.
pub const MAX_HEADER_LEN: usize = 16 * 1024 * 1024;
