//! Simstim — act as an authenticated human on web chat platforms.
//!
//! Some chat platforms expose no API key, only an interactive login. Simstim
//! drives a real browser through that login, harvests the session cookies the
//! platform issues, stores them encrypted, and then speaks the platform's
//! private wire protocol so a canonical chat request works against any of
//! them.
//!
//! See `DESIGN.md` for architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cipher;
pub mod config;
pub mod credential;
pub mod logging;
pub mod schema;
pub mod store;

pub mod engine;
pub mod platforms;
pub mod session;

pub mod dispatch;
pub mod validator;

pub mod broker;
