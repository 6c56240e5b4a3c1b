//! gobuild-core
//!
//! Shared vocabulary of the gobuild service:
//! - the build-request identity and its reversible URL grammar
//! - the transparency-log hash machinery (record/node hashes, the
//!   row-major stored-hash layout, Merkle roots and proofs)
//! - signed-note keys and tree heads
//! - the supported-target table with its popularity tracker

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod error;
pub mod note;
pub mod request;
pub mod targets;
pub mod tlog;

pub use crate::error::Failure;
pub use crate::request::{BuildSpec, Page, ParseError, Request, parse_request};
