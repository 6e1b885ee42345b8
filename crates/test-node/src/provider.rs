//! In-memory `Provider` implementation.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Included};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use anyhow::{Result, anyhow};
use base64ct::{Base64UrlUnpadded, Encoding};
use blockstore::{Blockstore as _, InMemoryBlockstore};
use dwn_core::event::{Event, Notification, QUEUE_DEPTH, SubscribeFilter, Subscriber};
use dwn_core::provider::{
    BlockStore, DidResolver, Document, EventStream, KvStore, Provider, PublicKeyJwk,
    VerificationMethod,
};
use tokio::sync::broadcast;

/// An in-memory provider: blocks in a [`blockstore`] store, index keys in a
/// sorted map, events over a broadcast channel per tenant.
#[derive(Clone)]
pub struct ProviderImpl {
    blockstore: Arc<InMemoryBlockstore<64>>,
    kv: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    streams: Arc<RwLock<HashMap<String, broadcast::Sender<Event>>>>,
}

impl Provider for ProviderImpl {}

impl Default for ProviderImpl {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderImpl {
    #[must_use]
    pub fn new() -> Self {
        Self {
            blockstore: Arc::new(InMemoryBlockstore::<64>::new()),
            kv: Arc::new(RwLock::new(BTreeMap::new())),
            streams: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl BlockStore for ProviderImpl {
    async fn put(&self, _owner: &str, cid: &str, block: &[u8]) -> Result<()> {
        // HACK: convert the CID string to a blockstore CID
        let block_cid = cid::Cid::from_str(cid)?;
        self.blockstore.put_keyed(&block_cid, block).await.map_err(Into::into)
    }

    async fn get(&self, _owner: &str, cid: &str) -> Result<Option<Vec<u8>>> {
        let block_cid = cid::Cid::try_from(cid)?;
        let Some(bytes) = self.blockstore.get(&block_cid).await? else {
            return Ok(None);
        };
        Ok(Some(bytes))
    }

    async fn delete(&self, _owner: &str, cid: &str) -> Result<()> {
        let cid = cid::Cid::from_str(cid)?;
        self.blockstore.remove(&cid).await?;
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        unimplemented!("purge is not supported by the in-memory block store")
    }
}

impl KvStore for ProviderImpl {
    async fn put(&self, owner: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut kv = self.kv.write().map_err(|_| anyhow!("lock poisoned"))?;
        kv.insert(scoped(owner, key), value.to_vec());
        Ok(())
    }

    async fn get(&self, owner: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let kv = self.kv.read().map_err(|_| anyhow!("lock poisoned"))?;
        Ok(kv.get(&scoped(owner, key)).cloned())
    }

    async fn delete(&self, owner: &str, key: &str) -> Result<()> {
        let mut kv = self.kv.write().map_err(|_| anyhow!("lock poisoned"))?;
        kv.remove(&scoped(owner, key));
        Ok(())
    }

    async fn range(&self, owner: &str, lower: &str, upper: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let kv = self.kv.read().map_err(|_| anyhow!("lock poisoned"))?;
        let prefix = scoped(owner, "");

        let entries = kv
            .range((Included(scoped(owner, lower)), Excluded(scoped(owner, upper))))
            .map(|(key, value)| (key[prefix.len()..].to_string(), value.clone()))
            .collect();
        Ok(entries)
    }

    async fn purge(&self) -> Result<()> {
        let mut kv = self.kv.write().map_err(|_| anyhow!("lock poisoned"))?;
        kv.clear();
        Ok(())
    }
}

fn scoped(owner: &str, key: &str) -> String {
    format!("{owner}\u{1e}{key}")
}

impl EventStream for ProviderImpl {
    async fn subscribe(&self, owner: &str, filter: SubscribeFilter) -> Result<Subscriber> {
        let sender = {
            let mut streams = self.streams.write().map_err(|_| anyhow!("lock poisoned"))?;
            streams
                .entry(owner.to_string())
                .or_insert_with(|| broadcast::channel(QUEUE_DEPTH).0)
                .clone()
        };
        let receiver = sender.subscribe();

        let stream = futures::stream::unfold((receiver, filter), |(mut rx, filter)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if filter.is_match(&event) {
                            return Some((Notification::Event(event), (rx, filter)));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        return Some((Notification::Lagged(n), (rx, filter)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(Subscriber::new(Box::pin(stream)))
    }

    async fn emit(&self, owner: &str, event: &Event) -> Result<()> {
        let sender = {
            let streams = self.streams.read().map_err(|_| anyhow!("lock poisoned"))?;
            streams.get(owner).cloned()
        };
        if let Some(sender) = sender {
            // a send error means no live subscribers
            let _ = sender.send(event.clone());
        }
        Ok(())
    }
}

impl DidResolver for ProviderImpl {
    async fn resolve(&self, url: &str) -> Result<Document> {
        let did = url.split('#').next().unwrap_or(url);
        let Some(method_id) = did.strip_prefix("did:key:") else {
            return Err(anyhow!("unsupported DID method: {did}"));
        };

        // did:key encodes a multicodec-prefixed Ed25519 public key
        let (_, bytes) = multibase::decode(method_id)?;
        if bytes.len() != 34 || bytes[0..2] != [0xed, 0x01] {
            return Err(anyhow!("not an Ed25519 did:key: {did}"));
        }

        Ok(Document {
            id: did.to_string(),
            verification_method: vec![VerificationMethod {
                id: format!("{did}#{method_id}"),
                method_type: "JsonWebKey2020".to_string(),
                controller: did.to_string(),
                public_key_jwk: PublicKeyJwk {
                    kty: "OKP".to_string(),
                    crv: "Ed25519".to_string(),
                    x: Base64UrlUnpadded::encode_string(&bytes[2..]),
                    y: None,
                },
            }],
        })
    }
}
