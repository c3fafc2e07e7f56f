/// Outbound frame types and the channel wrappers that carry them
pub mod channel;
/// The per-connection request table and its event loop
pub mod connection;
/// Merging of server and client outbound streams over one channel
pub mod duplex;
/// The shared timer wheel used for request deadlines
pub mod expiry;
/// A single tracked request and its terminal-state machine
pub mod request;
