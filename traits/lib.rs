/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// An opaque handle to a processing stage (or a whole sub-graph) owned by a backend.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StageId(pub u64);

/// An opaque handle to one port of a stage.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PortId(pub u64);

/// Identifies a flow-blocking probe installed on a port.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ProbeId(pub u64);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PortDirection {
    Src,
    Sink,
}

/// Lifecycle of a stage or sub-graph.
///
/// `Idle` keeps every resource allocated so the stage can be resumed
/// without being rebuilt.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum StageState {
    Idle,
    Ready,
    Running,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AudioWave {
    Sine,
    Square,
    Saw,
    Triangle,
    Silence,
    WhiteNoise,
}

impl AudioWave {
    pub fn as_str(self) -> &'static str {
        match self {
            AudioWave::Sine => "sine",
            AudioWave::Square => "square",
            AudioWave::Saw => "saw",
            AudioWave::Triangle => "triangle",
            AudioWave::Silence => "silence",
            AudioWave::WhiteNoise => "white-noise",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum VideoPattern {
    Smpte,
    Snow,
    Black,
    Ball,
}

impl VideoPattern {
    pub fn as_str(self) -> &'static str {
        match self {
            VideoPattern::Smpte => "smpte",
            VideoPattern::Snow => "snow",
            VideoPattern::Black => "black",
            VideoPattern::Ball => "ball",
        }
    }
}

/// The concrete media a source stage generates.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SourceSpec {
    TestAudio { wave: AudioWave },
    TestVideo { pattern: VideoPattern },
}

impl SourceSpec {
    pub fn kind(&self) -> MediaKind {
        match *self {
            SourceSpec::TestAudio { .. } => MediaKind::Audio,
            SourceSpec::TestVideo { .. } => MediaKind::Video,
        }
    }

    /// The source used while a real one is not available yet: silence or black frames.
    pub fn placeholder(kind: MediaKind) -> SourceSpec {
        match kind {
            MediaKind::Audio => SourceSpec::TestAudio {
                wave: AudioWave::Silence,
            },
            MediaKind::Video => SourceSpec::TestVideo {
                pattern: VideoPattern::Black,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct QueueOptions {
    /// Zero means unbounded.
    pub max_buffers: u32,
    /// Drop old buffers instead of blocking upstream when full.
    pub leaky: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            max_buffers: 200,
            leaky: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StageKind {
    /// One sink port, any number of requested src ports.
    FanOut,
    Buffer(QueueOptions),
    Source(SourceSpec),
    /// Exposes its src port asynchronously, once data is flowing.
    Decode,
    Render(MediaKind),
    /// Sink half of a relay; lives in the producing sub-graph.
    RelayEgress,
    /// Src half of a relay; lives in the consuming sub-graph.
    RelayIngress,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MediaError {
    /// The engine refused to link two ports.
    Incompatible(String),
    /// The port being detached is not fed by this fan-out.
    NotAConsumer,
    /// The handle does not belong to the callee.
    InvalidArgument(String),
    /// The operation is not allowed in the current state, e.g. on an ended track.
    Precondition(String),
    /// The engine cannot construct the requested stage.
    Unavailable(String),
    /// Backend specific error.
    Backend(String),
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            MediaError::Incompatible(ref s) => write!(f, "incompatible link: {}", s),
            MediaError::NotAConsumer => write!(f, "port is not a consumer of this fan-out"),
            MediaError::InvalidArgument(ref s) => write!(f, "invalid argument: {}", s),
            MediaError::Precondition(ref s) => write!(f, "precondition failed: {}", s),
            MediaError::Unavailable(ref s) => write!(f, "unavailable: {}", s),
            MediaError::Backend(ref s) => write!(f, "backend error: {}", s),
        }
    }
}

impl Error for MediaError {}

pub type PortCallback = Box<dyn Fn(PortId) + Send + Sync>;
pub type NotifyCallback = Box<dyn Fn() + Send + Sync>;

/// The capability set the routing core needs from a media engine.
///
/// Control calls are made from a single cooperative thread. Callbacks
/// registered here may be invoked from the engine's own streaming threads.
pub trait GraphBackend: Send + Sync {
    /// Creates a top-level sub-graph with its own lifecycle.
    fn create_graph(&self, name: &str) -> Result<StageId, MediaError>;
    /// Creates a named stage inside `graph`. On failure nothing stays registered.
    fn create_stage(
        &self,
        graph: StageId,
        kind: &StageKind,
        name: &str,
    ) -> Result<StageId, MediaError>;
    /// Moves the stage to its terminal state and detaches it from its sub-graph.
    /// Removing a sub-graph removes every stage inside it.
    fn remove_stage(&self, stage: StageId) -> Result<(), MediaError>;
    fn stage_name(&self, stage: StageId) -> Option<String>;

    fn static_port(&self, stage: StageId, direction: PortDirection)
        -> Result<PortId, MediaError>;
    fn request_port(&self, stage: StageId) -> Result<PortId, MediaError>;
    fn release_port(&self, stage: StageId, port: PortId) -> Result<(), MediaError>;
    fn port_owner(&self, port: PortId) -> Option<StageId>;
    fn peer(&self, port: PortId) -> Option<PortId>;

    fn link(&self, src: PortId, sink: PortId) -> Result<(), MediaError>;
    fn unlink(&self, src: PortId, sink: PortId) -> Result<(), MediaError>;

    /// Drops all data passing `port` until the probe is removed.
    fn install_flow_block_probe(&self, port: PortId) -> Result<ProbeId, MediaError>;
    fn remove_probe(&self, port: PortId, probe: ProbeId);

    fn set_state(&self, stage: StageId, state: StageState) -> Result<(), MediaError>;
    fn state(&self, stage: StageId) -> Option<StageState>;
    /// A locked stage ignores state changes of its parent.
    fn set_locked_state(&self, stage: StageId, locked: bool);
    fn sync_state_with_parent(&self, stage: StageId) -> Result<(), MediaError>;
    /// Runs `graph` on the system clock with a zero base time.
    fn use_shared_clock(&self, graph: StageId) -> Result<(), MediaError>;

    fn pair_relay(&self, ingress: StageId, egress: StageId) -> Result<(), MediaError>;
    fn send_end_of_stream(&self, port: PortId) -> Result<(), MediaError>;

    fn connect_new_output_port(
        &self,
        stage: StageId,
        callback: PortCallback,
    ) -> Result<(), MediaError>;
    fn connect_end_of_stream(
        &self,
        graph: StageId,
        callback: NotifyCallback,
    ) -> Result<(), MediaError>;
}

/// Implemented by backends so the process-wide instance can be created generically.
pub trait BackendInit {
    fn init() -> Result<Arc<dyn GraphBackend>, MediaError>;
}
