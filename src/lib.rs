//! Sluice - Hierarchical Leaky-Bucket Admission Control
//!
//! This crate decides whether a unit of work should be admitted for a subject
//! key. Each key owns a leaky bucket that fills by one drip per admitted hit
//! and drains continuously at a fixed rate. Compound keys (`parent:child`)
//! are also charged against a bucket shared by every key with the same
//! prefix. Bucket state is persisted to a pluggable key-value store with
//! TTLs, so independent limiter instances see each other's hits.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
