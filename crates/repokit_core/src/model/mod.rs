//! Entity contracts shared by repositories and data contexts.
//!
//! # Responsibility
//! - Define what a persisted entity must expose to the access layer.
//! - Provide the value-level row shape exchanged with data contexts.
//!
//! # Invariants
//! - Every entity is identified by an ordered `EntityKey`.
//! - Identity equality is defined by key, never by field-wise comparison.

pub mod entity;
