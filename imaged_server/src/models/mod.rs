//! Build history data models.

pub mod build;
pub mod record;
