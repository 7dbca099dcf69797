//! Roundhouse, an SMTP multiplexor.
//!
//! Accepts SMTP clients and copies each client's session, live, to every
//! configured SMTP server, answering the client with replies of its own.
//! Useful for trying several mail server configurations against a
//! production stream.

pub mod auth;
pub mod backend;
pub mod client;
pub mod config;
pub mod multiplexer;
pub mod proxy;
pub mod reply;
pub mod session;
pub mod tls;
pub mod utils;

pub use config::{Opt, ProxyConfig};
pub use multiplexer::{Multiplexer, SessionError};
pub use proxy::SmtpProxy;
