//! Pipeline components and store access.

pub mod build;
pub mod deploy;
pub mod github;
pub mod integration_service;
pub mod mirror;
pub mod ncp;
pub mod orchestrator;
pub mod pipeline;
pub mod poller;
pub mod registry;
pub mod rollback;
pub mod run_service;
pub mod signer;
