//! `lectern`: a client-side query and mutation cache.
//!
//! Reads go through a [`cache::QueryRunner`] that deduplicates concurrent
//! fetches and serves fresh entries from a shared [`cache::CacheStore`];
//! writes go through a [`cache::MutationRunner`] that invalidates affected
//! key prefixes once the remote store confirms them. [`admin`] wires both to
//! the back-office tables.

pub mod admin;
pub mod cache;
pub mod config;
pub mod infra;
