#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! rtun library: the building blocks of the relay and the client.
//!
//! - `msg`: control-channel messages and the frame codec
//! - `auth`: token-derived privilege keys
//! - `config`: configuration loading
//! - `session`: per-connection reader, writer, and outbound queue
//! - `server`: public relay: control sessions, work-connection pools, tunnels
//! - `client`: private side: login loop, control session, tunnel state machine
//! - `net`: connection plumbing shared by both sides

pub mod auth;
pub mod backoff;
pub mod client;
pub mod config;
pub mod msg;
pub mod net;
pub mod server;
pub mod session;
