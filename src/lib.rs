// ABOUTME: Library root for osm-minutely
// ABOUTME: Minutely OSM diff fetcher, decoder, CSV emitter and sequence tracker

pub mod commands;
pub mod config;
pub mod emitter;
pub mod error;
pub mod osc;
pub mod pipeline;
pub mod replication;
pub mod tracker;
pub mod utils;

pub use error::{DecodeError, PipelineError, TrackerError};
pub use replication::SequenceNumber;
