pub mod webhook_handler;
