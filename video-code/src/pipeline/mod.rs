//! Job pipeline: descriptors, encoders, the process registry, the dispatch
//! boundary and the orchestrating service.

pub mod descriptor;
pub mod dispatch;
pub mod encoder;
pub mod registry;
pub mod service;

pub use descriptor::{EncodingParams, JobDescriptor, fec_ratio};
pub use dispatch::{
    ChannelTransport, Delivery, JOB_TOPIC, JobConsumer, JobConsumerConfig, JobProducer,
    JobTransport, Subscription,
};
pub use encoder::{
    CloudEncoder, Encoder, EncoderSet, EncodingRequest, ScriptEncoder, ScriptEncoderConfig,
};
pub use registry::{JobRegistry, ProcessHandle};
pub use service::{
    INTERRUPTED_MESSAGE, JobOutput, JobStatusView, ServiceConfig, SubmitJobCommand, UploadSource,
    UploadedFile, VideoCodeService,
};
