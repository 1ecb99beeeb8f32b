use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::{
    DEFAULT_L2CAP_MTU, DEFAULT_L2CAP_PSM, DEFAULT_MAX_FRAME_LEN, SCAN_TIMEOUT_SECS, UUID_GLIMPSE_SERVICE,
    UUID_KEEP_ALIVE_CHAR,
};

/// Radio and channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Service the glasses advertise; used as the scan filter.
    pub service_uuid: Uuid,
    /// Characteristic the glasses notify on to wake the host.
    pub keep_alive_uuid: Uuid,
    /// L2CAP PSM of the image/audio channel
    pub psm: u16,
    /// Maximum bytes per stream write, and per read on the receive side.
    pub mtu: usize,
    pub scan_timeout_secs: u64,
    /// Inbound frames announcing more than this are treated as a stream error.
    pub max_frame_len: u32,
}

impl Default for RadioConfig {
    fn default() -> Self {
        RadioConfig {
            service_uuid: UUID_GLIMPSE_SERVICE,
            keep_alive_uuid: UUID_KEEP_ALIVE_CHAR,
            psm: DEFAULT_L2CAP_PSM,
            mtu: DEFAULT_L2CAP_MTU,
            scan_timeout_secs: SCAN_TIMEOUT_SECS,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}
