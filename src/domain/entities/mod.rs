pub mod alert;
pub mod instrument;
pub mod notification;
pub mod order;
pub mod position;
pub mod transaction;
