//! quarters — a room allocation and waitlist engine for hostel/residence
//! administration. One [`engine::Engine`] per hostel: capacity ledger,
//! request intake, allocation matcher with compensating multi-record
//! sequences, a priority waitlist, batch runs, and an append-only journal
//! as the persistence layer.

pub mod auth;
pub mod compactor;
pub mod engine;
pub mod hostel;
pub mod journal;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod payment;
