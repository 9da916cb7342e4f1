//! This crate implements the core of the DICOM upper layer protocol:
//! the part of DICOM networking which sets up, carries and tears down
//! associations between application entities over TCP.
//!
//! This crate can be used as a base
//! for concrete service class users (SCUs)
//! and service class providers (SCPs),
//! which plug into an association through a received data handler.
//!
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_
//!   and their binary codec.
//! - The [`negotiation`] module
//!   builds presentation context proposals
//!   and decides on them as an acceptor.
//! - The [`association`] module
//!   comprises the association state machine,
//!   from establishment to release or abort,
//!   with P-Data fragmentation and reassembly.
//!
//! ## Features
//! * `sync-tls`: Enables establishing associations over TLS with `rustls`.
//!   See [`InitiatorOptions`] and [`AcceptorOptions`] for details.

pub mod association;
pub mod negotiation;
pub mod pdu;

/// The implementation class UID of this upper layer implementation.
///
/// Generated as per the standard, part 5, section B.2.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.259610843588510366251515464147378990438";

/// The implementation version name of this upper layer implementation.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOM-ULP 0.1";

// re-exports

pub use association::{AcceptorOptions, Association, InitiatorOptions};
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
