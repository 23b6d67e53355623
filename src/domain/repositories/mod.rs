pub mod notification_transport;
