//! SCPI protocol layer for GW Instek PSW series bench power supplies.
//!
//! The supply is driven over a USB-CDC serial link (9600 baud, 8-N-1) with
//! CR+LF terminated text commands. [`Psw`] formats commands, parses replies and
//! mirrors the last commanded state; [`Transport`] is the line-oriented link
//! underneath it.

pub mod error;
pub mod instrument;
pub mod transport;

#[cfg(test)]
mod mock_transport;

pub use error::{PswError, Result};
pub use instrument::*;
pub use transport::{SerialSettings, SerialTransport, Transport};
