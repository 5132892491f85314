mod backup;
mod confirm;
mod control;
mod machine;
mod orchestrator;
mod preflight;
mod resume;
mod stages;
mod store;

pub use backup::{create_backup, sha256_file, BackupSummary};
pub use confirm::{AssumeYes, Confirm};
pub use control::ControlSurface;
pub use machine::{StageMachine, StageVerdict};
pub use orchestrator::{
    detect_resume_point, CheckpointStatus, CleanReport, Orchestrator, Outcome, ResumePoint,
    ResumeRequest, RunRequest, StatusReport, TargetSpec,
};
pub use preflight::{
    check_disk_space, check_package_database, check_pkg_lock, ensure_no_active_run,
    PKG_CHECK_COMMAND,
};
pub use resume::ResumeScheduler;
pub use stages::StageFlow;
pub use store::{read_completion_record, write_completion_record, StateStore};
