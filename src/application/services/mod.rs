pub mod alert_intake;
pub mod notify_worker;
