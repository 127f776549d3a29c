//! # relay-core
//!
//! Core abstractions for the Relay transaction orchestration engine.
//!
//! Foundational types shared by every Relay component:
//!
//! - **Identifiers**: Strongly-typed IDs for transactions, steps, and events
//! - **Completion Tokens**: Unguessable credentials guarding step completion
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and standard span helpers
//!
//! ## Crate Boundary
//!
//! Shared primitives live here and nowhere else. The engine crate
//! (`relay-flow`) builds on these contracts and never redefines them.
//!
//! ## Example
//!
//! ```rust
//! use relay_core::{CompletionToken, StepId, TxId};
//!
//! let tx = TxId::generate();
//! let step = StepId::generate();
//! let token = CompletionToken::mint();
//! assert!(token.matches(&token.clone()));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;
pub mod token;

pub use error::{Error, Result};
pub use id::{EventId, StepId, TxId};
pub use observability::{LogFormat, init_logging};
pub use token::CompletionToken;
