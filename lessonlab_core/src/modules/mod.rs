//! Lesson state machines.
//!
//! Hardware: [`bits`], [`gates`], [`cpu`], [`memory`], [`cache`].
//! Backend: [`request`], [`tcp`], [`database`], [`btree`], [`balancer`].
//! Distributed: [`consensus`].

pub mod balancer;
pub mod bits;
pub mod btree;
pub mod cache;
pub mod consensus;
pub mod cpu;
pub mod database;
pub mod gates;
pub mod memory;
pub mod request;
pub mod tcp;
