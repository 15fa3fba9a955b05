//! Response bodies handed back to callers, and the capture/replay of chunked bodies.

use std::{
    collections::VecDeque,
    error::Error as StdError,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, combinators::BoxBody};
use hyper::body::{Body, Frame, SizeHint};

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Body type of every response produced by [`crate::fetch::SnapshotFetch`].
pub type FetchBody = BoxBody<Bytes, BoxError>;

pub fn boxed_full(body: impl Into<Bytes>) -> FetchBody {
    Full::new(body.into())
        .map_err(|never| -> BoxError { match never {} })
        .boxed()
}

pub fn boxed_chunks(chunks: Vec<String>) -> FetchBody {
    ChunkReplayBody::new(chunks).boxed()
}

/// Drains `body`, decoding each data frame as UTF-8 text. One string is produced per data
/// frame, in arrival order. A multi-byte character split across frames is emitted with the
/// frame that completes it; invalid sequences become U+FFFD.
pub async fn capture_chunks<B>(mut body: B) -> Result<Vec<String>, B::Error>
where
    B: Body<Data = Bytes> + Unpin,
{
    let mut decoder = Utf8ChunkDecoder::default();
    let mut chunks = Vec::new();
    while let Some(frame_result) = body.frame().await {
        let frame = frame_result?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        chunks.push(decoder.decode(&data));
    }

    if let Some(rest) = decoder.finish() {
        match chunks.last_mut() {
            Some(last) => last.push_str(&rest),
            None => chunks.push(rest),
        }
    }
    Ok(chunks)
}

#[derive(Debug, Default)]
struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    fn decode(&mut self, data: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(data);

        let mut out = String::with_capacity(input.len());
        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, invalid) = rest.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &invalid[len..];
                        }
                        None => {
                            // Incomplete sequence at the end: wait for the next frame.
                            self.pending = invalid.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&self.pending).into_owned())
    }
}

/// Emits stored chunks one data frame per poll, in order, then ends.
#[derive(Debug)]
pub struct ChunkReplayBody {
    chunks: VecDeque<Bytes>,
}

impl ChunkReplayBody {
    pub fn new(chunks: Vec<String>) -> Self {
        Self {
            chunks: chunks.into_iter().map(Bytes::from).collect(),
        }
    }

    #[cfg(test)]
    fn from_raw(chunks: Vec<Bytes>) -> Self {
        Self {
            chunks: chunks.into(),
        }
    }
}

impl Body for ChunkReplayBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        Poll::Ready(this.chunks.pop_front().map(|chunk| Ok(Frame::data(chunk))))
    }

    fn is_end_stream(&self) -> bool {
        self.chunks.is_empty()
    }

    fn size_hint(&self) -> SizeHint {
        let remaining: usize = self.chunks.iter().map(Bytes::len).sum();
        SizeHint::with_exact(u64::try_from(remaining).unwrap_or(u64::MAX))
    }
}
