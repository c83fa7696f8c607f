//! Trade replication.
//!
//! Watches the provider account, turns changes into copy links and keeps
//! every receiver (and optionally a duplicate on the provider itself) in
//! step with it.

pub mod detector;
pub mod dispatcher;
pub mod engine;
pub mod filter;
pub mod link;
pub mod manual;
pub mod retry;
pub mod sltp;

pub use detector::PositionEvent;
pub use dispatcher::{
    DispatchStats, Dispatcher, DuplicateSettings, ErrorClass, ErrorPolicy, Operation, OperationOutput,
    OperationRequest, ReceiverAccount,
};
pub use engine::{build_dispatcher, CycleReport, EngineSettings, ReplicationEngine};
pub use filter::{FilterDecision, RejectReason, SizedOrder};
pub use link::{CloseAction, CopyLink, LinkKey, LinkState, LinkTarget, TransitionError};
pub use manual::{ControlHandle, ManualCloseHandler, ManualCommand, ManualPlan};
pub use retry::{BackoffPolicy, OperationKind, RetryDecision, RetryManager, RetryTask};
