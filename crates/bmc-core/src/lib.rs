pub mod log_feed;
pub mod view_buffer;

pub use log_feed::{
    classify_frame, derive_logger_name, parse_event_time, FrameError, HttpRequestInfo, LogEvent,
    LogFrame, Normalizer, RawLogEvent, ROOT_LOGGER_PREFIX,
};
pub use view_buffer::{EventBuffer, DEFAULT_BUFFER_CAPACITY};
