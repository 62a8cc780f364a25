use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

pub type RequestId = u64;
pub type MethodName = String;
pub type RpcParams = Vec<serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub id: RequestId,
    pub method: MethodName,
    pub params: RpcParams,
}

impl RpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: RpcParams) -> Self {
        RpcRequest {
            id,
            method: method.into(),
            params,
        }
    }
}

/// Request id generator owned by a single proxy instance.
///
/// Ids are monotonically increasing from a clock-derived seed, so two
/// proxies created in the same process produce disjoint sequences. Tests
/// that need reproducible ids can pin the start with
/// [`with_start`](Self::with_start).
#[derive(Debug)]
pub struct RequestIdSource {
    next: AtomicU64,
}

impl RequestIdSource {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self::with_start(seed)
    }

    pub fn with_start(start: u64) -> Self {
        RequestIdSource {
            next: AtomicU64::new(start),
        }
    }

    pub fn next_id(&self) -> RequestId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RequestIdSource {
    fn default() -> Self {
        Self::new()
    }
}
