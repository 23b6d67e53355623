pub mod alert_adapter;
pub mod backoff;
pub mod normalization;
