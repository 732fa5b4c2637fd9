pub mod config;
pub mod container;
pub mod ipc;
pub mod persistence;
pub mod runtime;

pub use config::{IntercomConfig, OrchestratorConfig, SchedulerConfig, StorageConfig, load_config};
pub use container::{
    AgentRecord, ContainerInput, RunStatus, TypingState, VolumeMount, container_image,
    parse_agent_records, runner_container_path, runner_dir_name,
};
pub use ipc::{IpcGroupContext, IpcTask};
pub use persistence::{
    ChatInfo, ConversationMessage, NewMessage, RegisteredGroup, ScheduledTask, Store, TaskRunLog,
    TaskUpdate,
};
pub use runtime::RuntimeKind;
