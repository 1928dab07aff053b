//! Error types for the relay core.
//!
//! Each failure mode has its own type so callers can decide what reaches a
//! subscriber, what is only logged, and what marks a feed as failed.  None of
//! them is fatal to the process.

use thiserror::Error;

/// The upstream stream subscription for a symbol could not be established.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("upstream subscription failed: {0}")]
pub struct UpstreamError(pub String);

impl From<anyhow::Error> for UpstreamError {
    fn from(err: anyhow::Error) -> Self {
        Self(format!("{err:#}"))
    }
}

/// A stream tick that cannot be turned into a candle.  The tick is dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedTick {
    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("field {0} has an invalid value")]
    InvalidField(&'static str),

    #[error("open time {open_time} is not before close time {close_time}")]
    InvertedTimes { open_time: i64, close_time: i64 },

    #[error("interval {got} does not match relay interval {expected}")]
    IntervalMismatch { expected: String, got: String },

    #[error("tick for {got} arrived on the {expected} stream")]
    SymbolMismatch { expected: String, got: String },
}

/// A REST backfill response that matches neither supported encoding.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShapeError {
    #[error("backfill body is a JSON {0}, expected an array or object")]
    Body(&'static str),

    #[error("backfill row {index}: {reason}")]
    Row { index: usize, reason: String },
}

/// Why a cold-path backfill produced no history.
#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("backfill request failed: {0:#}")]
    Fetch(anyhow::Error),

    #[error(transparent)]
    Shape(#[from] ShapeError),
}

/// A subscriber sink refused a message.  The subscriber is dropped.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SendFailed {
    #[error("subscriber queue is full")]
    Saturated,

    #[error("subscriber connection is closed")]
    Closed,
}

/// Errors returned to the transport layer by the relay entry points.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay is not accepting subscribers")]
    NotRunning,

    #[error("subscriber went away during join: {0}")]
    Delivery(#[from] SendFailed),
}
