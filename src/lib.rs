pub(crate) mod api;
pub mod classify;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod observability;
pub mod routing;
pub mod session;
pub mod state;
pub mod stream;
pub mod transport;

mod util;
