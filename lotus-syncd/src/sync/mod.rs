pub mod backoff;
pub mod cache;
pub mod engine;
pub mod index;
pub mod key;
pub mod loader;
pub mod local_watcher;
pub mod paths;
pub mod payload;
pub mod reconcile;
pub mod records;
pub mod remote;
pub mod status;
pub mod store;
pub mod tracker;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;
