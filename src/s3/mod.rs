//! S3-compatible object storage client: AWS Signature V4 request signing
//! and the operation set the cloud storage engine drives. Grounded on
//! `examples/original_source/include/util/s3Helpers.hpp` (signing) and
//! `include/storage/s3/S3Controller.hpp` (operation set), since the
//! teacher has no HTTP client of its own.

pub mod client;
pub mod sigv4;
pub mod xml;

pub use client::{S3Client, S3Credentials, S3Object};
