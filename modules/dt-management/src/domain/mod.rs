pub mod aas;
pub mod address;
pub mod binder;
pub mod catalog;
pub mod error;
pub mod events;
pub mod model;
pub mod model_builder;
pub mod orchestrator;
pub mod service;
