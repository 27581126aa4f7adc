//! vCenter access for the vSphere machine actuator
//!
//! - [`vim`]: the management API seam ([`VimClient`]) and its VI/JSON
//!   implementation in [`vim_http`]
//! - [`rest`]: the REST tagging API ([`RestClient`])
//! - [`session`]: process-wide session cache keyed by server, user and datacenter
//! - [`tags`]: per-session tag and category cache
//! - `simulator`: in-memory vCenter, behind the `simulator` feature

#![deny(missing_docs)]

pub mod error;
pub mod http;
pub mod rest;
pub mod session;
#[cfg(any(test, feature = "simulator"))]
pub mod simulator;
pub mod tags;
pub mod types;
pub mod vim;
pub mod vim_http;
pub mod wire;

pub use error::{Error, Result};
pub use rest::{HttpRestClient, RestClient};
pub use session::{Connector, Session, SessionCache, SessionKey, SessionParams, VCenterConnector};
pub use tags::CachingTagManager;
pub use types::*;
pub use vim::{wait_for_task, VimClient};
pub use vim_http::HttpVimClient;
