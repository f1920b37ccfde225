//! ICY metadata deinterleaving
//!
//! Icecast/Shoutcast servers that were sent `Icy-MetaData: 1` insert a
//! metadata block after every `icy-metaint` bytes of audio: one length byte
//! `N`, then `N * 16` bytes of `key='value';` text. The deinterleaver strips
//! those blocks out of the body and hands them back separately. Its state
//! survives across chunks, so a block may be split over any number of
//! network reads.

use bytes::Bytes;
use tracing::debug;

use crate::stream::metadata::MetadataBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Audio bytes left before the next length byte
    Audio { remaining: usize },
    /// Next byte is the block length in 16-byte units
    MetadataLength,
    /// Metadata bytes left in the current block
    MetadataBytes { remaining: usize },
}

/// Output of one `process` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deinterleaved {
    pub audio: Bytes,
    pub metadata: Vec<MetadataBlock>,
}

/// Strips ICY metadata from a body stream.
pub struct MetadataDeinterleaver {
    step: usize,
    state: State,
    block: Vec<u8>,
}

impl MetadataDeinterleaver {
    /// `metadata_step` is the `icy-metaint` value; 0 makes the deinterleaver
    /// a pass-through.
    pub fn new(metadata_step: u32) -> Self {
        let step = metadata_step as usize;
        Self {
            step,
            state: State::Audio { remaining: step },
            block: Vec::new(),
        }
    }

    /// Pass-through deinterleaver
    pub fn inert() -> Self {
        Self::new(0)
    }

    pub fn can_process_metadata(&self) -> bool {
        self.step > 0
    }

    /// Split one network chunk into audio and completed metadata blocks.
    pub fn process(&mut self, input: Bytes) -> Deinterleaved {
        if !self.can_process_metadata() {
            return Deinterleaved {
                audio: input,
                metadata: Vec::new(),
            };
        }

        // Whole chunk inside the current audio run: no copy needed.
        if let State::Audio { remaining } = self.state {
            if input.len() < remaining {
                self.state = State::Audio {
                    remaining: remaining - input.len(),
                };
                return Deinterleaved {
                    audio: input,
                    metadata: Vec::new(),
                };
            }
        }

        let mut audio = Vec::with_capacity(input.len());
        let mut metadata = Vec::new();
        let mut pos = 0;

        while pos < input.len() {
            let available = input.len() - pos;
            match self.state {
                State::Audio { remaining } => {
                    let n = remaining.min(available);
                    audio.extend_from_slice(&input[pos..pos + n]);
                    pos += n;
                    self.state = if remaining == n {
                        State::MetadataLength
                    } else {
                        State::Audio {
                            remaining: remaining - n,
                        }
                    };
                }
                State::MetadataLength => {
                    let len = input[pos] as usize * 16;
                    pos += 1;
                    self.state = if len == 0 {
                        State::Audio {
                            remaining: self.step,
                        }
                    } else {
                        self.block.clear();
                        State::MetadataBytes { remaining: len }
                    };
                }
                State::MetadataBytes { remaining } => {
                    let n = remaining.min(available);
                    self.block.extend_from_slice(&input[pos..pos + n]);
                    pos += n;
                    if remaining == n {
                        match MetadataBlock::parse(&self.block) {
                            Some(block) => metadata.push(block),
                            None => debug!(len = self.block.len(), "dropping unparseable ICY block"),
                        }
                        self.block.clear();
                        self.state = State::Audio {
                            remaining: self.step,
                        };
                    } else {
                        self.state = State::MetadataBytes {
                            remaining: remaining - n,
                        };
                    }
                }
            }
        }

        Deinterleaved {
            audio: Bytes::from(audio),
            metadata,
        }
    }
}
