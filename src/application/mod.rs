//! Application layer orchestrating the negotiation engine.
//!
//! `OfferService` loads requests and offers from the stores, asks the pure engine for a
//! decision, commits the resulting state changes under a per-request lock with a version check
//! on the request, completes any cascade-close and then dispatches notifications.

pub mod service;
