//! Domain types and pure rules for the safety-box distribution service.
//!
//! Nothing in this crate touches the database or the network; storage and
//! HTTP layers feed it plain values and act on the decisions it returns.

pub mod campaign;
pub mod catalog;
pub mod eligibility;
pub mod humanize;
pub mod incident;
pub mod notification;
pub mod qr;
pub mod rut;
pub mod types;
