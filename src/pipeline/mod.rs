//! Producer side of the pipeline and the handoff to the test stage.

mod artifact;
mod builder;
mod channel;

pub use artifact::{BuildOutcome, BuiltArtifact};
pub use builder::{ProducerOutcome, ProjectBuilder};
pub use channel::{ArtifactReceiver, ArtifactSender, ChannelClosed, artifact_channel};
