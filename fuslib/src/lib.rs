//! Client library for the vendor firmware update service (FUS).
//!
//! A download goes through [`session::SessionBuilder::connect`],
//! [`metadata::FirmwareMetadata::fetch`],
//! [`metadata::FirmwareMetadata::initialize_transfer`] and finally
//! [`transfer::TransferPipeline::run`].

pub mod catalogue;
pub mod constants;
pub mod crypto;
pub mod metadata;
pub mod session;
pub mod transfer;
pub mod version;

mod xml;
