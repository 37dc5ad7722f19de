//! A programmatic, realtime operational-transform client for a
//! collaborative markdown service.
//!
//! The crate is organized the way the underlying system is layered: a
//! transport-agnostic OT primitive ([`op`]), the client-side OT state
//! machine built on top of it ([`ot_client`]), the document-replica-owning
//! [`session::SessionClient`] that drives the state machine over a real
//! [`transport::Transport`], and [`macros::MacroEngine`], an optional layer
//! that reacts to remote edits by expanding macros in the live document.

pub mod config;
pub mod error;
pub mod macros;
pub mod op;
pub mod ot_client;
pub mod session;
pub mod transport;

pub use config::{ReconnectConfig, RateLimitConfig, SessionConfig, UndoConfig};
pub use error::{CoreError, CoreResult};
pub use macros::{MacroDefinition, MacroEngine};
pub use op::{Atom, TextOperation};
pub use ot_client::{Collaborators, OtClient, OtState};
pub use session::{ChangeEvent, LifecycleEvent, Permission, SessionClient};
pub use transport::{Transport, WebSocketTransport};
