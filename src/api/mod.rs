pub mod backend_proxy;
pub mod chat_relay;
pub(crate) mod common;
pub mod health;
