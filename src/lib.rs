//! Channel/link routing core: recycling-chain splicing, invocation contexts,
//! recall duplication and the stage walker.

pub mod behavior;
pub mod config;
pub mod context;
pub mod control;
pub mod dsl;
pub mod duplicate;
pub mod engine;
pub mod error;
pub mod graph;
#[doc(hidden)]
pub mod harness;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod invariant_rt;
pub mod link;
pub mod plan;
pub mod recall;
pub mod recycling;
pub mod rt;
pub mod splice;
pub mod states;
pub mod walker;

pub use behavior::{Behavior, BehaviorDef, StageContext, StageOutcome};
pub use config::EngineConfig;
pub use context::{AllocationReport, GroupId, InvocationContext};
pub use control::WalkerEvent;
pub use engine::{Engine, GarbageReport};
pub use error::{BehaviorError, Result, RoutingError};
pub use graph::{ChannelId, ChannelKind, DeviceFlags, DeviceId, Graph, Owner};
pub use recall::{RecallId, RecallInstance, RecallScope};
pub use recycling::RecyclingId;
pub use rt::{RtEngine, TickReport};
pub use splice::RecyclingChange;
pub use states::{Phase, Purpose, PurposeSet, RecallState, Stage};
pub use walker::StageReport;
