//! Pipeline integration
//!
//! - **queue**: pending submissions
//! - **coordinator**: switch-latest event loop per pipeline slot
//! - **planner**: scene and dialogue turn planning
//! - **image**: image-prompt derivation from scene revisions
//! - **sinks**: audio playback and image generation interfaces
//! - **orchestrator**: wires everything together

pub mod config;
pub mod coordinator;
pub mod image;
pub mod orchestrator;
pub mod planner;
pub mod queue;
pub mod sinks;

pub use config::{DialogueConfig, SceneConfig, StagehandConfig};
pub use coordinator::{
    PipelineConfig, PipelineCoordinator, PipelineEvent, PipelineHandle, Settlement, SlotState,
    SlotStatus, TriggerSender, TurnTicket,
};
pub use image::{
    is_empty_scene, ImageConfig, ImageDeriverHandle, ImagePromptDeriver, RenderedImage,
};
pub use orchestrator::{Stagehand, StagehandBuilder, StagehandHandle};
pub use planner::{DialoguePlanner, DialogueTurn, ScenePlanner, SceneTurn, TurnCommit, TurnPlanner};
pub use queue::{QueuedInput, SubmissionQueue, TriggerSource, INSTRUCTION_SEPARATOR};
pub use sinks::{
    AudioSink, ChannelAudioSink, ImageGenerator, NullAudioSink, PlaceholderImageGenerator,
    PLACEHOLDER_IMAGE_URL,
};
