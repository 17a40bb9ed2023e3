pub mod container;
pub mod dedup;
pub mod feed_rkyv;
pub mod geometry;
pub mod interpolate;
pub mod pipeline;
pub mod prepare_container;
pub mod prepare_feed_as_rkyv;
pub mod schedule;
