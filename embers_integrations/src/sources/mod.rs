//! HTTP record sources. Each source is behind its own cargo feature.

#[cfg(feature = "socrata")]
pub mod socrata;
