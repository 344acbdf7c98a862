//! HTTP client layer: the ClientHello-emulating transport and the profile
//! table it draws from.

pub mod profiles;
pub mod transport;

pub use transport::WreqTransport;
