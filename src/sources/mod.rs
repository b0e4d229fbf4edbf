//! Upstream APIs: endpoint definitions, table layouts and key selection

pub mod brreg;
pub mod enin;
