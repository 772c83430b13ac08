//! Client for the EODMS ordering service: search imagery collections, submit
//! orders for the records found, and download the prepared products.
//!
//! [`app::Eodms`] ties the pieces together. Every network call goes through a
//! [`transport::Transport`], so the whole workflow can be driven by a scripted
//! transport in tests.

#![forbid(unsafe_code)]

pub mod app;
pub mod auth;
pub mod cancel;
pub mod config;
pub mod domain;
pub mod download;
pub mod error;
pub mod geometry;
pub mod order;
pub mod output;
pub mod params;
pub mod query;
pub mod store;
pub mod transport;
