//! cert-manager DNS-01 webhook solver
//!
//! Verifies every challenge request against the issuer's ACME account key
//! before any DNS provider is touched, caches providers per challenge and
//! scopes provider credentials in the process environment.

pub mod providers;
pub mod server;
pub mod solver;
