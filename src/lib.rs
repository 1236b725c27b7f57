//! A client-side driver for the tus resumable upload protocol family: the
//! stable v1.0.0 protocol and the interop draft. Drives one logical upload
//! through creation or resumption, chunked transmission with retry, and
//! (optionally) parallel segmentation into partial uploads that the server
//! concatenates.
//!
//! The driver itself never touches the network, a filesystem, or a
//! database directly — it depends on four small capability traits:
//! [`transport::HttpClient`], [`source::ByteSource`], [`store::UrlStore`],
//! and [`fingerprint::Fingerprinter`]. Default implementations are provided
//! for common cases ([`default_client::ReqwestHttpClient`] behind the
//! `default_client` feature, [`source::FileByteSource`] /
//! [`source::MemoryByteSource`], [`store::MemoryUrlStore`], and
//! [`fingerprint::Sha256Fingerprinter`]); implement the traits yourself
//! against whatever HTTP stack, storage, or hashing your host already uses.

#[macro_use]
extern crate log;

pub mod driver;
pub mod error;
pub mod fingerprint;
pub mod options;
pub mod protocol;
pub mod request;
pub mod retry;
pub mod source;
pub mod store;
pub mod terminate;
pub mod transport;

#[cfg(feature = "default_client")]
pub mod default_client;

pub use driver::{Driver, DriverState};
pub use error::{Error, Result};
pub use options::{Callbacks, ChunkSize, UploadLength, UploadRequest};
pub use protocol::Protocol;
