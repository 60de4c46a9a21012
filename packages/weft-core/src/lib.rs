//! Weft core — leaf types for the in-process dispatch runtime.
//!
//! This crate holds the pieces the dispatch layer is built on:
//!
//! 1. **Messages** (`message`): lazily-materialized payloads over byte
//!    streams or in-memory buffers, one-shot unless explicitly buffered
//! 2. **Run state** (`run_state`): endpoint lifecycle gating dispatch
//! 3. **Session context** (`session`): opaque per-call key/value metadata
//! 4. **Listener contract** (`listener`): what a local receiver exposes
//!    to the dispatch core

pub mod listener;
pub mod message;
pub mod run_state;
pub mod session;

pub use listener::LocalListener;
pub use message::{Message, MessageError, TeeReader};
pub use run_state::{RunState, RunStateHandle, StateWaitTimeout};
pub use session::SessionContext;
