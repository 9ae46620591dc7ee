//! Event Channel
//!
//! A closed set of lifecycle events published by a directory, delivered to
//! exactly one consumer registered when the directory is constructed.
//!
//! Consumers are either a callback (the cache uses this to aggregate
//! counters) or a crossbeam channel (metrics collectors, tests).

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};

/// Events emitted by a multiplexed directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    /// A reader was constructed for a file
    FileRead { dir: PathBuf, file: String },

    /// Deleted bytes crossed the compaction threshold
    LogCompact { dir: PathBuf },

    /// Bytes committed to a file
    WriteReported { bytes: u64 },

    /// Streams allocated
    StreamsReported { streams: u64 },
}

type Callback = Arc<dyn Fn(MuxEvent) + Send + Sync>;

#[derive(Clone)]
enum Target {
    Discard,
    Callback(Callback),
    Channel(Sender<MuxEvent>),
}

/// Publish point for directory events
#[derive(Clone)]
pub struct EventSink {
    target: Target,
}

impl EventSink {
    /// A sink that drops every event
    pub fn discard() -> Self {
        Self {
            target: Target::Discard,
        }
    }

    /// A sink that invokes `f` synchronously on the publishing thread
    ///
    /// Directories publish with none of their locks held, so `f` may call
    /// back into the directory that raised the event.
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(MuxEvent) + Send + Sync + 'static,
    {
        Self {
            target: Target::Callback(Arc::new(f)),
        }
    }

    /// A sink backed by an unbounded channel, plus its receiving end
    pub fn channel() -> (Self, Receiver<MuxEvent>) {
        let (tx, rx) = channel::unbounded();
        (
            Self {
                target: Target::Channel(tx),
            },
            rx,
        )
    }

    /// Publish an event. Never fails: a disconnected receiver drops it.
    pub fn publish(&self, event: MuxEvent) {
        match &self.target {
            Target::Discard => {}
            Target::Callback(f) => f(event),
            Target::Channel(tx) => {
                let _ = tx.send(event);
            }
        }
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::discard()
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.target {
            Target::Discard => "discard",
            Target::Callback(_) => "callback",
            Target::Channel(_) => "channel",
        };
        f.debug_struct("EventSink").field("target", &kind).finish()
    }
}
