/// Host telemetry sources for registration and status updates.
pub mod sys_info;
