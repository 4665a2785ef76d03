pub mod build_service;
pub mod executor;
pub mod harvest;
pub mod packer;
pub mod record_service;
pub mod secrets;
pub mod templates;
pub mod translate;
pub mod worker;
