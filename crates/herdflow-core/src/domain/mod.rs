//! Domain model for the workflow engine

pub mod action;
pub mod collaborators;
pub mod condition;
pub mod decision;
pub mod events;
pub mod instance;
pub mod module_update;
pub mod repository;
pub mod step;
pub mod template;
pub mod timer;
