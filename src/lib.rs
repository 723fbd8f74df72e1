pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod flush_worker;
pub mod frame;
pub mod poller;
pub mod reading;
pub mod serial_channel;
pub mod serial_utils;
pub mod shutdown;
pub mod sink;
