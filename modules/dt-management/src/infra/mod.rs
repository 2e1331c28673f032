pub mod bridge;
pub mod broker;
pub mod catalog;
pub mod connector;
pub mod docker;
pub mod forwarder;
pub mod kafka;
pub mod log_forwarder;
pub mod mqtt;
pub mod ports;
pub mod readiness;
pub mod relay;
