pub mod telegram_transport;
