//! Record sources for embers: external APIs implementing `RecordSource`.

pub mod sources;
