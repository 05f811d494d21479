//! Client half of the crate: dial/pair/stream plus the decode-side
//! presentation pipeline (spec §4.3, §4.5).

pub mod decode_pipeline;
pub mod host_list;
pub mod session;
pub mod tls;
