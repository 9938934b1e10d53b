mod tracker;

pub use tracker::{AdjacentNodeStatus, AdjacentObservation, KeyingEvent, KeyingEventKind, KeyingSnapshot, KeyingTracker};
