//! # Data
//!
//! Record payloads. Payloads at or below [`MAX_ENCODED_SIZE`] are carried
//! inline in the message entry as base64url `encoded_data`; larger payloads
//! live in the data store, content-addressed by their data CID and read
//! back one chunk at a time.

use std::fmt;
use std::io::Read;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::provider::BlockStore;
use crate::store;

/// The maximum size (in bytes) of a record payload embedded in the message
/// entry instead of the data store.
pub const MAX_ENCODED_SIZE: usize = 30_000;

type FetchBlock = Arc<dyn Fn(&str) -> Result<Option<Vec<u8>>> + Send + Sync>;

/// A one-shot payload reader with a known length: an in-memory buffer for
/// caller-supplied payloads, or a lazy handle over the data store that
/// fetches each chunk as the reader reaches it. Re-reading requires
/// constructing a new stream (`RecordsRead` does so on each request).
#[derive(Clone)]
pub struct DataStream {
    source: Source,
}

#[derive(Clone)]
enum Source {
    Memory {
        buffer: Vec<u8>,
        position: usize,
    },
    Stored {
        size: usize,
        links: Vec<String>,
        fetch: FetchBlock,
        current: Option<(Vec<u8>, usize)>,
        next: usize,
    },
}

impl DataStream {
    /// The total payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.source {
            Source::Memory { buffer, .. } => buffer.len(),
            Source::Stored { size, .. } => *size,
        }
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compute the payload's data CID and size. Stored payloads are hashed
    /// chunk by chunk without buffering the whole payload.
    ///
    /// # Errors
    ///
    /// Returns an error when a chunk cannot be fetched or the CID cannot be
    /// computed.
    pub fn compute_cid(&self) -> Result<(String, usize)> {
        match &self.source {
            Source::Memory { buffer, .. } => Ok((crate::cid::from_bytes(buffer), buffer.len())),
            Source::Stored { links, fetch, .. } => {
                let mut hasher = Sha256::new();
                let mut size = 0;
                for link in links {
                    let Some(block) = fetch(link)? else {
                        return Err(crate::unexpected!("missing data chunk"));
                    };
                    hasher.update(&block);
                    size += block.len();
                }
                Ok((crate::cid::from_digest(&hasher.finalize())?, size))
            }
        }
    }

    /// Open a lazy stream over a stored payload, returning `None` when no
    /// block is stored for `data_cid`. Only the chunk links are read here;
    /// chunk blocks are fetched on demand as the stream is consumed.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying store fails.
    pub async fn from_store<S>(
        owner: &str, data_cid: &str, data_size: u64, store: &S,
    ) -> Result<Option<Self>>
    where
        S: BlockStore + Clone + Send + Sync + 'static,
    {
        let Some(links) = store::data::links(owner, data_cid, store).await? else {
            return Ok(None);
        };

        let store = store.clone();
        let owner = owner.to_string();
        let fetch: FetchBlock = Arc::new(move |cid: &str| {
            // the sync reader bridges to the async store one chunk at a time
            futures::executor::block_on(BlockStore::get(&store, &owner, cid))
                .map_err(crate::Error::from)
        });

        Ok(Some(Self {
            source: Source::Stored {
                size: data_size as usize,
                links,
                fetch,
                current: None,
                next: 0,
            },
        }))
    }
}

impl Default for DataStream {
    fn default() -> Self {
        Self::from(Vec::new())
    }
}

impl fmt::Debug for DataStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStream").field("len", &self.len()).finish()
    }
}

impl From<Vec<u8>> for DataStream {
    fn from(buffer: Vec<u8>) -> Self {
        Self {
            source: Source::Memory { buffer, position: 0 },
        }
    }
}

impl Read for DataStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.source {
            Source::Memory { buffer, position } => {
                let remaining = &buffer[*position..];
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                *position += n;
                Ok(n)
            }
            Source::Stored { links, fetch, current, next, .. } => loop {
                if let Some((chunk, position)) = current {
                    let remaining = &chunk[*position..];
                    if !remaining.is_empty() {
                        let n = remaining.len().min(buf.len());
                        buf[..n].copy_from_slice(&remaining[..n]);
                        *position += n;
                        return Ok(n);
                    }
                    *current = None;
                }
                if *next >= links.len() {
                    return Ok(0);
                }
                let link = &links[*next];
                *next += 1;
                let block = fetch(link)
                    .map_err(std::io::Error::other)?
                    .ok_or_else(|| std::io::Error::other("missing data chunk"))?;
                *current = Some((block, 0));
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use test_node::key_store::ALICE_DID;
    use test_node::provider::ProviderImpl;

    use super::*;
    use crate::store::data::CHUNK_SIZE;

    #[test]
    fn read_to_end() {
        let mut stream = DataStream::from(b"record payload".to_vec());
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"record payload");

        // one-shot: a second read yields nothing
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn cid_stable_across_reads() {
        let stream = DataStream::from(b"some data".to_vec());
        let (cid_1, size) = stream.compute_cid().unwrap();
        let (cid_2, _) = stream.compute_cid().unwrap();
        assert_eq!(cid_1, cid_2);
        assert_eq!(size, 9);
    }

    #[tokio::test]
    async fn lazy_store_stream() {
        let provider = ProviderImpl::new();

        // payload spanning multiple chunks
        let data: Vec<u8> = (0..CHUNK_SIZE * 2 + 50).map(|i| (i % 251) as u8).collect();
        let stream = DataStream::from(data.clone());
        let (data_cid, _) = stream.compute_cid().unwrap();
        crate::store::data::put(ALICE_DID, "record-1", &data_cid, stream, &provider)
            .await
            .unwrap();

        let mut lazy =
            DataStream::from_store(ALICE_DID, &data_cid, data.len() as u64, &provider)
                .await
                .unwrap()
                .unwrap();
        assert_eq!(lazy.len(), data.len());

        // chunks are fetched as the reader advances
        let mut fetched = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = lazy.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            fetched.extend_from_slice(&buf[..n]);
        }
        assert_eq!(fetched, data);
    }
}
