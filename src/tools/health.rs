//! `health` tool: returns `healthSnapshot()` verbatim (§6).

use serde_json::Value;

use crate::error::GatewayError;
use crate::manager::GatewayManager;
use crate::pool::Pool;

pub async fn run(manager: &GatewayManager, pool: &Pool) -> Result<Value, GatewayError> {
    Ok(manager.stats(&pool.stats()).await)
}
