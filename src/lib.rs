pub mod config;
pub mod credential;
pub mod error;
pub mod probe;
pub mod session;
pub mod transport;
pub mod trust;
pub mod upload;

#[cfg(feature = "impl-russh")]
pub mod impl_russh;
