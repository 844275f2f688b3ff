//! `pkg_fcgi`: a FastCGI responder serving a read-only ports/packages
//! catalog over a Gemini-flavored line protocol (see `SPEC_FULL.md`).
//!
//! The binary entry point (`src/bin/pkg_fcgi.rs`) is a thin shell around
//! [`config::parse`] and [`supervisor::run`]; everything else lives here so
//! it can be unit-tested without forking or touching a real socket.

pub mod catalog;
pub mod config;
pub mod connection;
pub mod error;
pub mod output;
pub mod record;
pub mod request;
pub mod router;
pub mod supervisor;
pub mod text;
pub mod worker;
