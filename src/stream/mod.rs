mod connection;
mod error;
mod media_stream;
mod reads;

pub use connection::StreamConnection;
pub use error::StreamError;
pub use media_stream::{MediaStream, StreamStats};
pub use reads::{Read, ReadType, RecentReads};
