//! Line framing for one inbound stream.

use crate::event::LiveError;
use crate::hub::{IngestOutcome, LiveHub};
use futures::StreamExt;
use std::fmt;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use yueli_core::PipelineCounters;

/// Why a stream stopped being read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    Eof,
    /// Nothing arrived within the read timeout.
    IdleTimeout,
    IoError(String),
}

impl fmt::Display for StreamEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamEnd::Eof => f.write_str("eof"),
            StreamEnd::IdleTimeout => f.write_str("idle_timeout"),
            StreamEnd::IoError(e) => write!(f, "io_error: {}", e),
        }
    }
}

/// Feed every line of `reader` into `hub` until the stream ends.
///
/// Each read waits at most `read_timeout`. Over-long lines are counted as
/// invalid and skipped; blank lines are ignored.
pub async fn pump<R>(hub: &LiveHub, reader: R, read_timeout: Duration, max_line_bytes: usize) -> StreamEnd
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(max_line_bytes));
    // The framed stream yields one `None` after a codec error before it
    // resumes reading.
    let mut after_error = false;

    loop {
        let next = match tokio::time::timeout(read_timeout, lines.next()).await {
            Ok(next) => next,
            Err(_) => return StreamEnd::IdleTimeout,
        };
        match next {
            None if after_error => after_error = false,
            None => return StreamEnd::Eof,
            Some(Ok(line)) => {
                after_error = false;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let IngestOutcome::Accepted { delivered } = hub.ingest_line(line).await {
                    tracing::trace!(delivered, "Live line accepted");
                }
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                after_error = true;
                PipelineCounters::bump(&hub.counters().live_received);
                PipelineCounters::bump(&hub.counters().live_invalid);
                tracing::warn!("{}", LiveError::LineTooLong(max_line_bytes));
            }
            Some(Err(LinesCodecError::Io(e))) => return StreamEnd::IoError(e.to_string()),
        }
    }
}
