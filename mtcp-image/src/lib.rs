//! Data model and readers for checkpoint images and live process maps.
//!
//! This crate covers the live `/proc/self/maps` scanner and the
//! checkpoint image reader. Both produce the same [`types::Area`]
//! descriptor; `mtcp-restart` consumes both uniformly when deciding what a
//! live mapping should become.

pub mod decode;
pub mod maps;
pub mod types;

pub use decode::{find_header, Decoder, ImageError, Payload};
pub use maps::{read_maps_line, MapsError};
pub use types::{Area, MtcpHeader, Properties, AREA_NAME_MAX, MTCP_SIGNATURE};
