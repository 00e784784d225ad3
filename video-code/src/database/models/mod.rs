//! Database models.

pub mod video_record;

pub use video_record::{CompletedOutput, RecordStatus, VideoRecordDbModel};
