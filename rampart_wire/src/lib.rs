#![forbid(unsafe_code)]
//! Family-polymorphic socket addressing for the Rampart transport
#![deny(
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_features
)]

/// The default error type for this crate
pub mod error;
/// The peer address value type
pub mod socket_addr;

pub use error::AddrError;
pub use socket_addr::{AddressFamily, LocalPath, SocketAddress, LOCAL_PATH_MAX};
