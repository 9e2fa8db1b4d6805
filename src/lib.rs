pub mod campaign;
pub mod checkpoint;
pub mod config;
pub mod debugger;
pub mod error;
pub mod injection;
pub mod targets;
pub mod trace;

pub mod prelude {
    pub use crate::campaign::backend::{CheckpointBackend, CheckpointLayout, InjectorBackend, ProbeBackend};
    pub use crate::campaign::console::{ChannelConsole, LocalArtifacts};
    pub use crate::campaign::counter::{CancelToken, IterationCounter};
    pub use crate::campaign::outcome::{Category, Outcome};
    pub use crate::campaign::results::{IterationResult, ResultLog};
    pub use crate::campaign::worker::{Selection, WorkerPool};
    pub use crate::campaign::{Campaign, CampaignOptions};
    pub use crate::checkpoint::CheckpointInjector;
    pub use crate::config::{Args, Backend, Config, Mode};
    pub use crate::debugger::{OpenOcd, Simics, TcpConnection};
    pub use crate::error::Error;
    pub use crate::injection::{InjectionDescriptor, InjectionRecord, Timing};
    pub use crate::targets::{selector::Selector, Architecture, Catalog};
    pub use crate::trace::TraceStore;
}
