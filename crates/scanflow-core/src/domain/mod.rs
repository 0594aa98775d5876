//! Domain model (IDs, stage table, topology, run context, events, rewards, errors).

pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod message;
pub mod reward;
pub mod stage;
pub mod topology;

pub use self::context::{RunContext, StageOutput};
pub use self::errors::{
    BridgeError, BrokerError, BuildError, ContextError, ErrorKind, StageError, StoreError,
    SubmitError,
};
pub use self::events::{
    EventPayload, PipelineOutput, ResultEnvelope, ScanResult, StageEvent, StageEventType,
};
pub use self::ids::{MessageId, OwnerId, RunId, TaskId};
pub use self::message::{Delivery, DeliveryTag, Message, StageMessage};
pub use self::reward::{
    CatalogItem, Classification, Grant, GrantOutcome, PersistMessage, PersistTarget,
    RewardDecision, RewardRequest, RewardSource, RewardSummary,
};
pub use self::stage::{Chain, StageDescriptor, StageId, UnknownStage};
pub use self::topology::{DlqRoute, QueueSpec, Topology};
