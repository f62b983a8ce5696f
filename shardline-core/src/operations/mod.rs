pub mod locate_chunk;
pub mod promote_standby;

pub use locate_chunk::{
    ChunkAccess, LocateChunkOperation, LocateChunkOperationOutcome, LocateChunkOperationRequest,
    LocateChunkOperationResult, NodeHandle,
};
pub use promote_standby::{
    PromoteStandbyOperation, PromoteStandbyOperationOutcome, PromoteStandbyOperationRequest,
    PromoteStandbyOperationResult, StandbyPromotion,
};
