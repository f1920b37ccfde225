//! Remote stream handling
//!
//! Fetches a remote audio resource over HTTP and shapes it for a decoder:
//! response classification, ICY metadata extraction, retry and network-wait
//! handling, and the bounded byte channel the decoder pulls from.

pub mod channel;
pub mod connectivity;
pub mod headers;
pub mod http;
pub mod icy;
pub mod metadata;
pub mod retry;
pub mod source;
pub mod types;

pub use channel::{BoundedByteChannel, ChannelStatus, Pull};
pub use connectivity::{
    monitor_for, reachability_target, ConnectivityMonitor, ManualConnectivity, NetworkKind,
    NetworkStatus, TcpProbeConnectivity,
};
pub use headers::{AudioTypeHint, ParsedHeaderOutput, ResponseHeaderInterpreter};
pub use http::{HttpResponse, HttpStreamTask, HttpTransport, ReqwestTransport, StreamRequest};
pub use icy::MetadataDeinterleaver;
pub use metadata::{MetadataBlock, NowPlaying};
pub use retry::RetryScheduler;
pub use source::{RemoteAudioSource, SourceReader};
pub use types::{
    ExpectedContentLength, SourceEvent, SourceState, StreamDescriptor, StreamPosition,
};
