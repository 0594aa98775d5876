use async_trait::async_trait;

use crate::domain::{RunContext, StageError, StageId, StageOutput};

/// Opaque body of one pipeline stage.
///
/// Reads the accumulated context and returns only the keys it adds.
/// The executor merges them, so a handler cannot drop or overwrite earlier keys.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> StageId;

    async fn run(&self, ctx: &RunContext) -> Result<StageOutput, StageError>;
}
