//! Agent subprocess plumbing: command descriptors, prompts, output framing,
//! session-id extraction and workspace preparation.

pub mod codec;
pub mod command;
pub mod prompt;
pub mod session_id;
pub mod workspace;

use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

pub use codec::{OutputLineCodec, MAX_LINE_BYTES};

/// Frame an agent output stream into lossily decoded lines.
pub fn line_reader<R: AsyncRead>(stream: R) -> FramedRead<R, OutputLineCodec> {
    FramedRead::new(stream, OutputLineCodec::new())
}
