//! Frame dependency data model
//!
//! Value types describing how frames of a scalable encoding reference each
//! other: per-frame decode target indications, reusable dependency
//! templates, and the per-frame info an encoder callback produces. These
//! are the in-memory counterparts of the RTP Dependency Descriptor header
//! extension.

use std::fmt;

/// How a frame relates to one decode target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeTargetIndication {
    /// Frame is not present in the target
    NotPresent,
    /// Present but droppable without breaking later frames
    Discardable,
    /// Decoding can switch to this target at this frame
    Switch,
    /// Required for the target
    Required,
}

impl DecodeTargetIndication {
    /// Single-character encoding used in template strings
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '-' => Some(DecodeTargetIndication::NotPresent),
            'D' => Some(DecodeTargetIndication::Discardable),
            'S' => Some(DecodeTargetIndication::Switch),
            'R' => Some(DecodeTargetIndication::Required),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            DecodeTargetIndication::NotPresent => '-',
            DecodeTargetIndication::Discardable => 'D',
            DecodeTargetIndication::Switch => 'S',
            DecodeTargetIndication::Required => 'R',
        }
    }
}

impl fmt::Display for DecodeTargetIndication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// One reusable pattern in a dependency structure
///
/// Setters are brief so templates read close to their wire description:
/// `FrameDependencyTemplate::new().spatial_layer(1).dtis("-S").frame_diffs([2])`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameDependencyTemplate {
    pub spatial_id: u8,
    pub temporal_id: u8,
    pub decode_target_indications: Vec<DecodeTargetIndication>,
    pub frame_diffs: Vec<usize>,
    pub chain_diffs: Vec<usize>,
}

impl FrameDependencyTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spatial_layer(mut self, spatial_id: u8) -> Self {
        self.spatial_id = spatial_id;
        self
    }

    pub fn temporal_layer(mut self, temporal_id: u8) -> Self {
        self.temporal_id = temporal_id;
        self
    }

    /// One character per decode target: `-`, `D`, `S` or `R`
    pub fn dtis(mut self, dtis: &str) -> Self {
        self.decode_target_indications = dtis
            .chars()
            .filter_map(DecodeTargetIndication::from_char)
            .collect();
        debug_assert_eq!(
            self.decode_target_indications.len(),
            dtis.chars().count(),
            "invalid decode target indication in {dtis:?}"
        );
        self
    }

    /// Backward distances to this frame's direct dependencies
    pub fn frame_diffs<I: IntoIterator<Item = usize>>(mut self, diffs: I) -> Self {
        self.frame_diffs = diffs.into_iter().collect();
        self
    }

    /// Backward distance to each chain's most recent frame
    pub fn chain_diffs<I: IntoIterator<Item = usize>>(mut self, diffs: I) -> Self {
        self.chain_diffs = diffs.into_iter().collect();
        self
    }
}

/// The full dependency description a sender signals once per structure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameDependencyStructure {
    pub num_decode_targets: usize,
    pub num_chains: usize,
    /// For each decode target, the chain that protects it
    pub decode_target_protected_by_chain: Vec<usize>,
    pub templates: Vec<FrameDependencyTemplate>,
}

/// How a frame uses one encoder buffer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecBufferUsage {
    pub id: usize,
    pub referenced: bool,
    pub updated: bool,
}

impl CodecBufferUsage {
    pub fn reference(id: usize) -> Self {
        CodecBufferUsage {
            id,
            referenced: true,
            updated: false,
        }
    }

    pub fn update(id: usize) -> Self {
        CodecBufferUsage {
            id,
            referenced: false,
            updated: true,
        }
    }

    pub fn reference_and_update(id: usize) -> Self {
        CodecBufferUsage {
            id,
            referenced: true,
            updated: true,
        }
    }
}

/// One frame a scalability structure asks the encoder to produce
///
/// `id` identifies the position in the structure's pattern and is how
/// [`on_encode_done`](crate::svc::ScalableVideoController::on_encode_done)
/// finds the right decode target indications. A keyframe references
/// nothing and only updates buffers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerFrameConfig {
    pub id: Option<usize>,
    pub keyframe: bool,
    pub spatial_id: u8,
    pub temporal_id: u8,
    pub buffers: Vec<CodecBufferUsage>,
}

impl LayerFrameConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: usize) -> Self {
        self.id = Some(id);
        self
    }

    pub fn keyframe(mut self) -> Self {
        self.keyframe = true;
        self
    }

    pub fn s(mut self, spatial_id: u8) -> Self {
        self.spatial_id = spatial_id;
        self
    }

    pub fn t(mut self, temporal_id: u8) -> Self {
        self.temporal_id = temporal_id;
        self
    }

    pub fn reference(mut self, buffer: usize) -> Self {
        self.buffers.push(CodecBufferUsage::reference(buffer));
        self
    }

    pub fn update(mut self, buffer: usize) -> Self {
        self.buffers.push(CodecBufferUsage::update(buffer));
        self
    }

    pub fn reference_and_update(mut self, buffer: usize) -> Self {
        self.buffers.push(CodecBufferUsage::reference_and_update(buffer));
        self
    }

    pub fn is_keyframe(&self) -> bool {
        self.keyframe
    }
}

/// What the encoder actually produced for one frame, ready for signalling
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenericFrameInfo {
    pub spatial_id: u8,
    pub temporal_id: u8,
    pub encoder_buffers: Vec<CodecBufferUsage>,
    pub decode_target_indications: Vec<DecodeTargetIndication>,
    /// For each chain, whether this frame strengthens it
    pub part_of_chain: Vec<bool>,
}
