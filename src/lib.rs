pub mod agent;
pub mod browser;
pub mod extract;
pub mod gemini;
pub mod protocol;
pub mod store;

pub use agent::{
    AgentError, ChannelStatusSink, Controller, ControllerConfig, DecisionClient, NullStatusSink,
    StatusSink, TabDriver,
};
pub use browser::{ChromiumConfig, ChromiumTabs};
pub use gemini::{GeminiClient, GeminiConfig};
pub use protocol::{
    ActionCommand, ExecutionOutcome, InteractableElement, PageInfo, ScrollDirection, StartReply,
    StatusEvent, StopReply, TabId,
};
pub use store::{DiskRunStore, MemoryRunStore, RunState, RunStore};
