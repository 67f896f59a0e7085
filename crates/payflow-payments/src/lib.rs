//! Payflow — Payments bounded context.
//!
//! Responsible for client applications (the merchant integrations allowed to
//! charge), charges with their capture and refund lifecycle, the client
//! application directory read model, and the auto-capture process.

pub mod application;
pub mod domain;
