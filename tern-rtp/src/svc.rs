//! Scalable video structures
//!
//! A [`ScalableVideoController`] decides, frame by frame, which layers an
//! encoder should produce and which codec buffers each layer references
//! and updates. After encoding, it turns the executed config back into
//! the dependency info the descriptor writer needs. Structures are
//! selected by their standard names ("L1T1", "L2T1_KEY").

use tracing::error;

use crate::dependency::{
    DecodeTargetIndication, FrameDependencyStructure, FrameDependencyTemplate, GenericFrameInfo,
    LayerFrameConfig,
};

/// Layer counts for one scalability structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLayersConfig {
    pub num_spatial_layers: u8,
    pub num_temporal_layers: u8,
}

/// Controls the layer structure of an encoded stream
pub trait ScalableVideoController {
    fn stream_config(&self) -> StreamLayersConfig;

    fn dependency_structure(&self) -> FrameDependencyStructure;

    /// Configs for the layer frames of the next temporal unit. `restart`
    /// forces the structure back to its keyframe pattern.
    fn next_frame_config(&mut self, restart: bool) -> Vec<LayerFrameConfig>;

    /// Converts an executed config into descriptor info. Returns `None`
    /// for a config this controller never issued.
    fn on_encode_done(&mut self, config: LayerFrameConfig) -> Option<GenericFrameInfo>;
}

/// Creates a controller by structure name, `None` when unknown
pub fn create_scalability_structure(name: &str) -> Option<Box<dyn ScalableVideoController>> {
    match name {
        "L1T1" => Some(Box::new(ScalabilityStructureL1T1::new())),
        "L2T1_KEY" => Some(Box::new(ScalabilityStructureL2T1Key::new())),
        _ => None,
    }
}

/// No layering: a keyframe, then deltas that each reference and update
/// the single buffer
#[derive(Debug)]
pub struct ScalabilityStructureL1T1 {
    start: bool,
}

impl ScalabilityStructureL1T1 {
    pub fn new() -> Self {
        ScalabilityStructureL1T1 { start: true }
    }
}

impl Default for ScalabilityStructureL1T1 {
    fn default() -> Self {
        Self::new()
    }
}

impl ScalableVideoController for ScalabilityStructureL1T1 {
    fn stream_config(&self) -> StreamLayersConfig {
        StreamLayersConfig {
            num_spatial_layers: 1,
            num_temporal_layers: 1,
        }
    }

    fn dependency_structure(&self) -> FrameDependencyStructure {
        FrameDependencyStructure {
            num_decode_targets: 1,
            num_chains: 1,
            decode_target_protected_by_chain: vec![0],
            templates: vec![
                FrameDependencyTemplate::new().dtis("S").chain_diffs([0]),
                FrameDependencyTemplate::new()
                    .dtis("S")
                    .frame_diffs([1])
                    .chain_diffs([1]),
            ],
        }
    }

    fn next_frame_config(&mut self, restart: bool) -> Vec<LayerFrameConfig> {
        if restart || self.start {
            self.start = false;
            vec![LayerFrameConfig::new().id(0).keyframe().update(0)]
        } else {
            vec![LayerFrameConfig::new().id(0).reference_and_update(0)]
        }
    }

    fn on_encode_done(&mut self, config: LayerFrameConfig) -> Option<GenericFrameInfo> {
        if config.id != Some(0) {
            error!(config_id = ?config.id, "unexpected layer frame config id");
            return None;
        }
        Some(GenericFrameInfo {
            spatial_id: config.spatial_id,
            temporal_id: config.temporal_id,
            encoder_buffers: config.buffers,
            decode_target_indications: vec![DecodeTargetIndication::Switch],
            part_of_chain: vec![true],
        })
    }
}

/// Decode target indications per config id, targets ordered (S0, S1).
/// Ids: 0 = keyframe S0, 1 = delta S0, 2 = S1.
const L2T1_KEY_DTIS: [[DecodeTargetIndication; 2]; 3] = [
    [DecodeTargetIndication::Switch, DecodeTargetIndication::Switch],
    [DecodeTargetIndication::Switch, DecodeTargetIndication::NotPresent],
    [DecodeTargetIndication::NotPresent, DecodeTargetIndication::Switch],
];

/// Two spatial layers, one temporal layer, inter-layer prediction only
/// on keyframes. After the key pattern each spatial layer predicts from
/// its own chain.
#[derive(Debug)]
pub struct ScalabilityStructureL2T1Key {
    keyframe_next: bool,
}

impl ScalabilityStructureL2T1Key {
    pub fn new() -> Self {
        ScalabilityStructureL2T1Key { keyframe_next: true }
    }
}

impl Default for ScalabilityStructureL2T1Key {
    fn default() -> Self {
        Self::new()
    }
}

impl ScalableVideoController for ScalabilityStructureL2T1Key {
    fn stream_config(&self) -> StreamLayersConfig {
        StreamLayersConfig {
            num_spatial_layers: 2,
            num_temporal_layers: 1,
        }
    }

    fn dependency_structure(&self) -> FrameDependencyStructure {
        FrameDependencyStructure {
            num_decode_targets: 2,
            num_chains: 2,
            decode_target_protected_by_chain: vec![0, 1],
            templates: vec![
                FrameDependencyTemplate::new()
                    .spatial_layer(0)
                    .dtis("S-")
                    .frame_diffs([2])
                    .chain_diffs([2, 1]),
                FrameDependencyTemplate::new().spatial_layer(0).dtis("SS").chain_diffs([0, 0]),
                FrameDependencyTemplate::new()
                    .spatial_layer(1)
                    .dtis("-S")
                    .frame_diffs([2])
                    .chain_diffs([1, 2]),
                FrameDependencyTemplate::new()
                    .spatial_layer(1)
                    .dtis("-S")
                    .frame_diffs([1])
                    .chain_diffs([1, 1]),
            ],
        }
    }

    fn next_frame_config(&mut self, restart: bool) -> Vec<LayerFrameConfig> {
        if restart {
            self.keyframe_next = true;
        }
        // buffer 0 holds the latest S0 frame, buffer 1 the latest S1 frame
        let configs = if self.keyframe_next {
            vec![
                LayerFrameConfig::new().id(0).s(0).keyframe().update(0),
                LayerFrameConfig::new().id(2).s(1).reference(0).update(1),
            ]
        } else {
            vec![
                LayerFrameConfig::new().id(1).s(0).reference_and_update(0),
                LayerFrameConfig::new().id(2).s(1).reference_and_update(1),
            ]
        };
        self.keyframe_next = false;
        configs
    }

    fn on_encode_done(&mut self, config: LayerFrameConfig) -> Option<GenericFrameInfo> {
        let id = match config.id {
            Some(id) if id < L2T1_KEY_DTIS.len() => id,
            other => {
                error!(config_id = ?other, "unexpected layer frame config id");
                return None;
            }
        };
        let part_of_chain = if config.is_keyframe() {
            vec![true, true]
        } else {
            vec![config.spatial_id == 0, config.spatial_id == 1]
        };
        Some(GenericFrameInfo {
            spatial_id: config.spatial_id,
            temporal_id: config.temporal_id,
            encoder_buffers: config.buffers,
            decode_target_indications: L2T1_KEY_DTIS[id].to_vec(),
            part_of_chain,
        })
    }
}
