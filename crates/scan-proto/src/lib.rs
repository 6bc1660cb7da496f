//! Wire protocol spoken between the scan client and an indexer endpoint:
//! tagged messages framed with a u32 length prefix, plus the consistency
//! vector and key-collation ordering the scan broker builds on.

pub mod codec;
pub mod collate;
pub mod messages;
pub mod timestamp;

pub use codec::FrameCodec;
pub use messages::Message;
pub use timestamp::{Consistency, TsVector};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("frame of {0} bytes exceeds the maximum payload size")]
    FrameTooLarge(usize),
    #[error("truncated frame header")]
    TruncatedHeader,
    #[error("unknown message tag {0}")]
    UnknownTag(u16),
    #[error("failed to decode {tag:?} payload")]
    Payload {
        tag: messages::MessageTag,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
