//! Domain model: requests, offers, the negotiation rules between them, and the ports the
//! orchestration layer needs from the outside world.

pub mod negotiation;
pub mod notification;
pub mod ports;
pub mod request;
pub mod response;
