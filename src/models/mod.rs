//! Data models for regclean.
//!
//! This module contains the image identity and metadata types shared by the
//! cache, the registry client and the garbage collector.

mod image;
mod metadata;

pub use image::{DEFAULT_REGISTRY, ImageRef};
pub use metadata::{ImageMetadata, ManifestMetadata};
