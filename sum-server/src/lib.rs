//! Line-counting demo server built on `socket_engine`.
//!
//! Every connected user keeps a running sum of the integers they send, and
//! `list` shows every connected user with their current sum.
//!
//! - [`cli`] parses the startup parameters (listen IP, port, sweep period).
//! - [`session`] tracks one accumulator per connection.
//! - [`command`] interprets a line of input against a session.
//! - [`app`] wires the engine, the consumer loop and the liveness sweep.

pub mod app;
pub mod cli;
pub mod command;
pub mod session;
