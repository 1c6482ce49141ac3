//! Configuration structs threaded through stage construction.
//!
//! Stages hold only the options relevant to them; there is no global
//! configuration state.

use masking::UnanalyzedPolicy;
use std::path::PathBuf;
use std::time::Duration;

/// Options of the masking stage.
#[derive(Clone, Debug)]
pub struct MaskOptions {
    /// Run the external decoder first to produce a reassembled capture for
    /// analysis. Without it, the analyzer sequences segments itself and may
    /// see less through heavy reordering or IP fragmentation.
    pub reassemble: bool,
    pub decoder_program: PathBuf,
    pub decoder_timeout: Duration,
    /// Ports decoded as TLS in addition to the protocol default.
    pub extra_tls_ports: Vec<u16>,
    /// UDP ports treated as VXLAN in addition to 4789.
    pub extra_vxlan_ports: Vec<u16>,
    /// What happens to TCP payload of flows the analyzer never saw.
    pub policy: UnanalyzedPolicy,
    /// Keep the intermediate reassembled capture instead of deleting it.
    pub keep_intermediate: bool,
}

impl Default for MaskOptions {
    fn default() -> Self {
        Self {
            reassemble: true,
            decoder_program: PathBuf::from("tshark"),
            decoder_timeout: decoder::DEFAULT_TIMEOUT,
            extra_tls_ports: Vec::new(),
            extra_vxlan_ports: Vec::new(),
            policy: UnanalyzedPolicy::default(),
            keep_intermediate: false,
        }
    }
}

/// Options of the batch driver.
#[derive(Clone, Debug, Default)]
pub struct BatchOptions {
    /// Abort the whole batch once a file fails.
    pub stop_on_error: bool,
    /// Worker count; `None` uses one worker per core.
    pub jobs: Option<usize>,
}
