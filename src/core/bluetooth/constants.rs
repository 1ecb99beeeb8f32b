//! Constants used throughout the application
//! UUIDs, channel parameters and timeouts shared with the glasses firmware.

use uuid::Uuid;

/// The UUID of the Glimpse service, advertised and used as the scan filter
pub const UUID_GLIMPSE_SERVICE: Uuid = Uuid::from_u128(0xdcbc7255_1e9e_49a0_a360_b0430b6c6905);

/// The UUID of the keep-alive characteristic; the glasses notify on it to wake the host
pub const UUID_KEEP_ALIVE_CHAR: Uuid = Uuid::from_u128(0x371a55c8_f251_4ad2_90b3_c7c195b049be);

/// L2CAP PSM of the image/audio channel
pub const DEFAULT_L2CAP_PSM: u16 = 150;

/// Channel MTU; also the chunk size for reads and writes
pub const DEFAULT_L2CAP_MTU: usize = 1251;

/// Upper bound on an announced inbound frame length
pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Scan duration in seconds before giving up
pub const SCAN_TIMEOUT_SECS: u64 = 10;

/// Delay between link re-establishment attempts when auto-reconnect is on
pub const RECONNECT_RETRY_DELAY_MS: u64 = 1000;

/// Outbound pipe capacity, in MTUs, before writes start coming back short
pub const OUTBOUND_PIPE_MTUS: usize = 4;

/// Channel reopen attempts on a live link before the link itself is dropped
pub const MAX_CHANNEL_REOPENS: u32 = 3;
