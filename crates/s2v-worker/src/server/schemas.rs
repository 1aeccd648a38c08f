use serde::{Deserialize, Serialize};
use s2v_core::SessionInfo;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub healthy: bool,
    pub generations: u64,
    #[serde(flatten)]
    pub session: SessionInfo,
}
