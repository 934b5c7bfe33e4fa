#![doc = include_str!("../README.md")]

pub mod bencode;
pub mod executor;
#[cfg(unix)]
pub mod reactor;
pub mod rtt;

pub use bencode::{decode, encode, DecodeError, Dict, EncodeError, Value};
pub use bytes::Bytes;
pub use executor::{SchedulingPool, SerializedExecutor};
#[cfg(unix)]
pub use reactor::{Reactor, RegistrationHandle, Selectable};
pub use rtt::RttEstimator;
