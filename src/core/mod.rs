//! 核心层：错误分类与恢复、运行阶段状态机、优雅关闭

pub mod error;
pub mod recovery;
pub mod shutdown;
pub mod state;

pub use error::{AgentError, ErrorCode, RecoveryAction};
pub use recovery::RecoveryEngine;
pub use shutdown::{AutomationCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use state::{PhaseTracker, RunPhase};
