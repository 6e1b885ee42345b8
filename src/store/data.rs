//! # Data Store
//!
//! Content-addressed payload storage. Payloads are streamed in chunks, each
//! chunk a `raw` IPLD block, linked from a DAG-CBOR root stored under the
//! payload's data CID. Reads are lazy: only the root's link list is loaded
//! up front, each chunk is fetched as the reader reaches it. Blocks are
//! reference-counted per `(record, data CID)` association and removed when
//! the last association disappears.

use std::io::{Cursor, Read};
use std::str::FromStr;

use cid::Cid;
use ipld_core::ipld::Ipld;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::provider::{BlockStore, KvStore};
use crate::store::block;
use crate::{bad_request, unexpected};

/// The chunk size (in bytes) of stored data blocks.
pub const CHUNK_SIZE: usize = 64 * 1024;

const SEP: char = '\u{0}';

/// Store a payload, verifying the streamed bytes hash to the declared data
/// CID, and associate it with `record_id`. Returns the stored byte count.
///
/// # Errors
///
/// Returns `Error::BadRequest` when the streamed bytes do not match
/// `data_cid`; partially written blocks are discarded.
pub async fn put<S: BlockStore + KvStore>(
    owner: &str, record_id: &str, data_cid: &str, mut reader: impl Read, store: &S,
) -> Result<usize> {
    let mut links = vec![];
    let mut byte_count = 0;
    let mut hasher = Sha256::new();

    // read the stream in chunks, storing each chunk as a block
    loop {
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let bytes_read =
            reader.read(&mut buffer).map_err(|e| unexpected!("issue reading data: {e}"))?;
        if bytes_read == 0 {
            break;
        }
        buffer.truncate(bytes_read);
        hasher.update(&buffer);

        let chunk_cid = crate::cid::from_bytes(&buffer);
        BlockStore::put(store, owner, &chunk_cid, &buffer).await?;

        let cid =
            Cid::from_str(&chunk_cid).map_err(|e| unexpected!("issue parsing CID: {e}"))?;
        links.push(Ipld::Link(cid));
        byte_count += bytes_read;
    }

    // the declared CID must match the streamed content
    let computed = crate::cid::from_digest(&hasher.finalize())?;
    if computed != data_cid {
        // discard the partial write
        for link in &links {
            if let Ipld::Link(cid) = link {
                BlockStore::delete(store, owner, &cid.to_string()).await?;
            }
        }
        return Err(bad_request!("data CID does not match data stream"));
    }

    // root block links the chunks; keyed by the data CID
    let root = block::encode(&Ipld::List(links))?;
    BlockStore::put(store, owner, data_cid, &root).await?;

    associate(owner, record_id, data_cid, store).await?;

    tracing::debug!(owner, record_id, data_cid, byte_count, "stored data");
    Ok(byte_count)
}

/// Read a payload's chunk links, returning `None` when no block is stored
/// for `data_cid`.
pub(crate) async fn links<S: BlockStore>(
    owner: &str, data_cid: &str, store: &S,
) -> Result<Option<Vec<String>>> {
    let Some(bytes) = BlockStore::get(store, owner, data_cid).await? else {
        return Ok(None);
    };

    // the root block holds links to the chunk blocks
    let Ipld::List(list) = block::decode(&bytes)? else {
        return Ok(None);
    };

    let mut chunk_cids = vec![];
    for link in list {
        let Ipld::Link(chunk_cid) = link else {
            return Err(unexpected!("invalid chunk link"));
        };
        chunk_cids.push(chunk_cid.to_string());
    }

    Ok(Some(chunk_cids))
}

/// Open a lazy reader over a payload, returning `None` when no block is
/// stored for `data_cid`. Only the root's link list is read here; chunk
/// blocks are fetched on demand as the reader is consumed.
pub async fn get<'a, S: BlockStore>(
    owner: &str, data_cid: &str, store: &'a S,
) -> Result<Option<ChunkedReader<'a, S>>> {
    let Some(links) = links(owner, data_cid, store).await? else {
        return Ok(None);
    };

    Ok(Some(ChunkedReader {
        owner: owner.to_string(),
        links,
        current: None,
        next: 0,
        store,
    }))
}

/// A lazy reader over a stored payload: holds the chunk link list and
/// fetches one chunk block at a time as reading advances.
pub struct ChunkedReader<'a, S: BlockStore> {
    owner: String,
    links: Vec<String>,
    current: Option<Cursor<Vec<u8>>>,
    next: usize,
    store: &'a S,
}

impl<S: BlockStore> Read for ChunkedReader<'_, S> {
    // the sync reader bridges to the async store one chunk at a time
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if let Some(current) = &mut self.current {
                let n = current.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                self.current = None;
            }
            if self.next >= self.links.len() {
                return Ok(0);
            }
            let link = &self.links[self.next];
            self.next += 1;

            let block =
                futures::executor::block_on(BlockStore::get(self.store, &self.owner, link))
                    .map_err(std::io::Error::other)?
                    .ok_or_else(|| std::io::Error::other("missing data chunk"))?;
            self.current = Some(Cursor::new(block));
        }
    }
}

/// Add a `(record, data CID)` association without re-uploading, for writes
/// that reuse a prior write's payload. Fails when no payload is stored.
///
/// # Errors
///
/// Returns `Error::BadRequest` when no block exists for `data_cid`.
pub async fn associate<S: BlockStore + KvStore>(
    owner: &str, record_id: &str, data_cid: &str, store: &S,
) -> Result<()> {
    if BlockStore::get(store, owner, data_cid).await?.is_none() {
        return Err(bad_request!("no data found for CID {data_cid}"));
    }
    KvStore::put(store, owner, &ref_key(data_cid, record_id), &[1]).await?;
    Ok(())
}

/// Remove a `(record, data CID)` association, deleting the payload blocks
/// when it was the last one.
pub async fn delete<S: BlockStore + KvStore>(
    owner: &str, record_id: &str, data_cid: &str, store: &S,
) -> Result<()> {
    KvStore::delete(store, owner, &ref_key(data_cid, record_id)).await?;

    // other records may still reference the payload
    let prefix = format!("REF{SEP}{data_cid}{SEP}");
    let mut bound = format!("REF{SEP}{data_cid}");
    bound.push('\u{1}');
    if !KvStore::range(store, owner, &prefix, &bound).await?.is_empty() {
        return Ok(());
    }

    // last association removed: drop the chunk blocks and root
    let Some(bytes) = BlockStore::get(store, owner, data_cid).await? else {
        return Ok(());
    };
    if let Ipld::List(links) = block::decode(&bytes)? {
        for link in links {
            if let Ipld::Link(chunk_cid) = link {
                BlockStore::delete(store, owner, &chunk_cid.to_string()).await?;
            }
        }
    }
    BlockStore::delete(store, owner, data_cid).await?;

    tracing::debug!(owner, record_id, data_cid, "dereferenced data");
    Ok(())
}

fn ref_key(data_cid: &str, record_id: &str) -> String {
    format!("REF{SEP}{data_cid}{SEP}{record_id}")
}

#[cfg(test)]
mod tests {
    use rand::RngCore;
    use test_node::key_store::ALICE_DID;
    use test_node::provider::ProviderImpl;

    use super::*;
    use crate::data::DataStream;

    #[tokio::test]
    async fn put_get_round_trip() {
        let provider = ProviderImpl::new();

        // payload spanning multiple chunks
        let mut data = vec![0u8; CHUNK_SIZE * 2 + 100];
        rand::thread_rng().fill_bytes(&mut data);
        let stream = DataStream::from(data.clone());
        let (data_cid, _) = stream.compute_cid().unwrap();

        let size = put(ALICE_DID, "record-1", &data_cid, stream, &provider).await.unwrap();
        assert_eq!(size, data.len());

        let mut reader = get(ALICE_DID, &data_cid, &provider).await.unwrap().unwrap();
        let mut fetched = Vec::new();
        reader.read_to_end(&mut fetched).unwrap();
        assert_eq!(fetched, data);
    }

    #[tokio::test]
    async fn chunked_read_on_demand() {
        let provider = ProviderImpl::new();

        let data: Vec<u8> = (0..CHUNK_SIZE * 3 + 17).map(|i| (i % 253) as u8).collect();
        let stream = DataStream::from(data.clone());
        let (data_cid, _) = stream.compute_cid().unwrap();
        put(ALICE_DID, "record-1", &data_cid, stream, &provider).await.unwrap();

        // read through a buffer smaller than a chunk, across chunk bounds
        let mut reader = get(ALICE_DID, &data_cid, &provider).await.unwrap().unwrap();
        let mut fetched = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            fetched.extend_from_slice(&buf[..n]);
        }
        assert_eq!(fetched, data);
    }

    #[tokio::test]
    async fn cid_mismatch_discards_blocks() {
        let provider = ProviderImpl::new();

        let stream = DataStream::from(vec![7u8; CHUNK_SIZE + 1]);
        let wrong_cid = crate::cid::from_bytes(b"something else");

        let result = put(ALICE_DID, "record-1", &wrong_cid, stream, &provider).await;
        assert!(matches!(result, Err(crate::Error::BadRequest(_))));
        assert!(get(ALICE_DID, &wrong_cid, &provider).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reference_counting() {
        let provider = ProviderImpl::new();

        let data = b"shared payload".to_vec();
        let stream = DataStream::from(data.clone());
        let (data_cid, _) = stream.compute_cid().unwrap();

        put(ALICE_DID, "record-1", &data_cid, stream, &provider).await.unwrap();
        associate(ALICE_DID, "record-2", &data_cid, &provider).await.unwrap();

        // one association removed: the payload survives
        delete(ALICE_DID, "record-1", &data_cid, &provider).await.unwrap();
        assert!(get(ALICE_DID, &data_cid, &provider).await.unwrap().is_some());

        // last association removed: the payload is gone
        delete(ALICE_DID, "record-2", &data_cid, &provider).await.unwrap();
        assert!(get(ALICE_DID, &data_cid, &provider).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn associate_requires_stored_payload() {
        let provider = ProviderImpl::new();
        let data_cid = crate::cid::from_bytes(b"never stored");

        let result = associate(ALICE_DID, "record-1", &data_cid, &provider).await;
        assert!(matches!(result, Err(crate::Error::BadRequest(_))));
    }
}
