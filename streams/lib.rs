//! Dynamic fan-out of live media: producers feed tracks, tracks feed any
//! number of consumers, and both ends can be rewired while data flows.

pub mod context;
pub mod id;
pub mod input;
pub mod output;
pub mod proxy;
pub mod stream;
pub mod tee;
pub mod track;

pub use context::{
    EngineEvent, EngineListener, ListenerId, MediaContext, MediaContextOptions, Notifier,
};
pub use id::{StreamId, TrackId};
pub use input::{BaseTrackInput, RemoteTrackInput};
pub use output::{StandaloneStreamOutput, StandaloneTrackOutput};
pub use proxy::{ProxyMultiplexer, RelayOutput};
pub use stream::{MediaStream, StreamEvent, StreamListenerId};
pub use tee::TeeMultiplexer;
pub use track::{MediaStreamTrack, ReadyState, TrackEvent, TrackInput};

#[cfg(test)]
mod tests;
