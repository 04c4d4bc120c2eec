//! Offline request caching and sync.
//!
//! Requests go through a [`proxy::DefaultResponseProxy`], which serves them
//! from the network or from local data according to a fetch strategy, applies
//! HTTP cache-control rules, shreds response bodies into queryable stores and
//! records mutations the server has not seen in a replayable sync log.

pub mod adapter;
pub mod cache;
pub mod config;
pub mod db;
pub mod http;
pub mod proxy;
pub mod query_handler;
pub mod shred;
pub mod store;
pub mod strategy;
pub mod sync;

#[cfg(test)]
mod test_support;
