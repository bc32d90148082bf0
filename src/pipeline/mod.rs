//! Episode pipeline: fetch, dispatch, download, resolve, rename, notify

pub mod locks;
pub mod orchestrator;
pub mod planner;
pub mod resolver;
pub mod state;
pub mod tracker;
pub mod traits;

#[cfg(test)]
pub mod mocks;
