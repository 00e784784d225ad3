//! Repositories.

pub mod video_record;

pub use video_record::{SqlxVideoRecordRepository, VideoRecordRepository};
