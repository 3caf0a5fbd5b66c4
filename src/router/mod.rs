//! 命令路由：本地处理器 / 云端委托

pub mod cloud;
pub mod command_router;
pub mod handlers;

pub use cloud::{CloudDelegate, HttpCloudDelegate};
pub use command_router::{CommandRouter, DispatchOutcome, COULD_NOT_PROCESS};
pub use handlers::{HandlerRegistry, LocalHandler, VerbHandler};
