//! Reference server for the live notification protocol: the `/ws` endpoint
//! speaking the envelope protocol plus REST access to the stored inbox.

pub mod channels;
pub mod middleware;
pub mod routes;
pub mod state;
