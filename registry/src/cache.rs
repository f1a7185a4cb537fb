use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::trace;

use crate::client::{Error, ObjectReader, Registry};
use crate::digest::Digest;
use crate::spec::Descriptor;

// https://github.com/opencontainers/distribution-spec/pull/293#issuecomment-1452780554
// objects at or below this size get their bytes cached inline; bigger ones only cache the
// descriptor and the next GET goes upstream again
const INLINE_SIZE_LIMIT: u64 = 4 * 1024 * 1024;

fn digest_key(repo: &str, digest: &Digest) -> String {
    format!("{repo}@{digest}")
}

fn tag_key(repo: &str, tag: &str) -> String {
    format!("{repo}:{tag}")
}

// one long-hold mutex per reference string, created on demand; holding it across the upstream
// round trip keeps a thundering herd from fetching the same object more than once
#[derive(Default)]
struct RefLocks(Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>);

impl RefLocks {
    async fn hold(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .0
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

#[derive(Default)]
struct Maps {
    // "repo@digest" => the repo is known to have the digest
    has: HashSet<String>,
    // "repo:tag" => digest
    tags: HashMap<String, Digest>,
    // digest => mediaType+size(+data); most recent storing lookup wins in the case of
    // upstream/cross-repo ambiguity
    data: HashMap<Digest, Descriptor>,
}

impl Maps {
    fn cached_bytes(&self, digest: &Digest) -> Option<ObjectReader> {
        let descriptor = self.data.get(digest)?;
        let data = descriptor.data.clone()?;
        Some(ObjectReader::from_bytes(descriptor.clone(), data))
    }

    // store a descriptor without clobbering previously cached inline bytes for the digest
    fn store_descriptor(&mut self, descriptor: &Descriptor) {
        let existing = self.data.get(&descriptor.digest);
        if existing.is_none_or(|d| d.data.is_none()) {
            let mut stored = descriptor.clone();
            stored.data = None;
            self.data.insert(stored.digest.clone(), stored);
        }
    }

    fn store_bytes(&mut self, descriptor: &Descriptor, data: bytes::Bytes) {
        let mut stored = descriptor.clone();
        stored.data = Some(data);
        self.data.insert(stored.digest.clone(), stored);
    }
}

enum GetKind {
    Manifest,
    Blob,
}

// a transparent in-memory cache on top of any registry client; assumes a one-shot process
// lifecycle (nothing ever expires), so use with care in anything long-running
pub struct CachingRegistry {
    inner: Arc<dyn Registry>,
    maps: Mutex<Maps>,
    locks: RefLocks,
}

impl CachingRegistry {
    pub fn new(inner: Arc<dyn Registry>) -> Self {
        CachingRegistry {
            inner,
            maps: Mutex::new(Maps::default()),
            locks: RefLocks::default(),
        }
    }

    async fn get_object(
        &self,
        repo: &str,
        digest: &Digest,
        kind: GetKind,
    ) -> Result<ObjectReader, Error> {
        let key = digest_key(repo, digest);
        let _guard = self.locks.hold(&key).await;

        {
            let maps = self.maps.lock().unwrap();
            if maps.has.contains(&key) {
                if let Some(reader) = maps.cached_bytes(digest) {
                    trace!("cache hit {key}");
                    return Ok(reader);
                }
            }
        }

        let reader = match kind {
            GetKind::Manifest => self.inner.get_manifest(repo, digest).await?,
            GetKind::Blob => self.inner.get_blob(repo, digest).await?,
        };
        let descriptor = reader.descriptor.clone();

        if descriptor.size > INLINE_SIZE_LIMIT {
            let mut maps = self.maps.lock().unwrap();
            maps.has.insert(key);
            maps.store_descriptor(&descriptor);
            return Ok(reader);
        }

        let data = reader.bytes().await?;
        let mut maps = self.maps.lock().unwrap();
        maps.has.insert(key);
        maps.store_bytes(&descriptor, data.clone());
        Ok(ObjectReader::from_bytes(descriptor, data))
    }
}

#[async_trait]
impl Registry for CachingRegistry {
    async fn get_manifest(&self, repo: &str, digest: &Digest) -> Result<ObjectReader, Error> {
        self.get_object(repo, digest, GetKind::Manifest).await
    }

    async fn get_blob(&self, repo: &str, digest: &Digest) -> Result<ObjectReader, Error> {
        self.get_object(repo, digest, GetKind::Blob).await
    }

    async fn get_tag(&self, repo: &str, tag: &str) -> Result<ObjectReader, Error> {
        let key = tag_key(repo, tag);
        let _guard = self.locks.hold(&key).await;

        {
            let maps = self.maps.lock().unwrap();
            if let Some(digest) = maps.tags.get(&key) {
                if let Some(reader) = maps.cached_bytes(digest) {
                    trace!("cache hit {key}");
                    return Ok(reader);
                }
            }
        }

        let reader = self.inner.get_tag(repo, tag).await?;
        let descriptor = reader.descriptor.clone();

        if descriptor.size > INLINE_SIZE_LIMIT {
            let mut maps = self.maps.lock().unwrap();
            maps.has.insert(digest_key(repo, &descriptor.digest));
            maps.tags.insert(key, descriptor.digest.clone());
            maps.store_descriptor(&descriptor);
            return Ok(reader);
        }

        let data = reader.bytes().await?;
        let mut maps = self.maps.lock().unwrap();
        maps.has.insert(digest_key(repo, &descriptor.digest));
        maps.tags.insert(key, descriptor.digest.clone());
        maps.store_bytes(&descriptor, data.clone());
        Ok(ObjectReader::from_bytes(descriptor, data))
    }

    async fn resolve_manifest(&self, repo: &str, digest: &Digest) -> Result<Descriptor, Error> {
        let key = digest_key(repo, digest);
        let _guard = self.locks.hold(&key).await;

        {
            let maps = self.maps.lock().unwrap();
            if maps.has.contains(&key) {
                if let Some(descriptor) = maps.data.get(digest) {
                    let mut descriptor = descriptor.clone();
                    descriptor.data = None;
                    return Ok(descriptor);
                }
            }
        }

        let descriptor = self.inner.resolve_manifest(repo, digest).await?;
        let mut maps = self.maps.lock().unwrap();
        maps.has.insert(key);
        maps.store_descriptor(&descriptor);
        Ok(descriptor)
    }

    async fn resolve_tag(&self, repo: &str, tag: &str) -> Result<Descriptor, Error> {
        let key = tag_key(repo, tag);
        let _guard = self.locks.hold(&key).await;

        {
            let maps = self.maps.lock().unwrap();
            if let Some(digest) = maps.tags.get(&key) {
                if let Some(descriptor) = maps.data.get(digest) {
                    let mut descriptor = descriptor.clone();
                    descriptor.data = None;
                    return Ok(descriptor);
                }
            }
        }

        let descriptor = self.inner.resolve_tag(repo, tag).await?;
        let mut maps = self.maps.lock().unwrap();
        maps.has.insert(digest_key(repo, &descriptor.digest));
        maps.tags.insert(key, descriptor.digest.clone());
        maps.store_descriptor(&descriptor);
        Ok(descriptor)
    }

    async fn resolve_blob(&self, repo: &str, digest: &Digest) -> Result<Descriptor, Error> {
        let key = digest_key(repo, digest);
        let _guard = self.locks.hold(&key).await;

        {
            let maps = self.maps.lock().unwrap();
            if maps.has.contains(&key) {
                if let Some(descriptor) = maps.data.get(digest) {
                    let mut descriptor = descriptor.clone();
                    descriptor.data = None;
                    return Ok(descriptor);
                }
            }
        }

        let descriptor = self.inner.resolve_blob(repo, digest).await?;
        let mut maps = self.maps.lock().unwrap();
        maps.has.insert(key);
        maps.store_descriptor(&descriptor);
        Ok(descriptor)
    }

    async fn push_manifest(
        &self,
        repo: &str,
        reference: &str,
        data: &[u8],
        media_type: &str,
    ) -> Result<Descriptor, Error> {
        let descriptor = self.inner.push_manifest(repo, reference, data, media_type).await?;
        let mut maps = self.maps.lock().unwrap();
        maps.has.insert(digest_key(repo, &descriptor.digest));
        if Digest::parse(reference).is_err() {
            maps.tags.insert(tag_key(repo, reference), descriptor.digest.clone());
        }
        if data.len() as u64 <= INLINE_SIZE_LIMIT {
            maps.store_bytes(&descriptor, bytes::Bytes::copy_from_slice(data));
        } else {
            maps.store_descriptor(&descriptor);
        }
        Ok(descriptor)
    }

    async fn push_blob(
        &self,
        repo: &str,
        descriptor: &Descriptor,
        body: ObjectReader,
    ) -> Result<Descriptor, Error> {
        let pushed = self.inner.push_blob(repo, descriptor, body).await?;
        let mut maps = self.maps.lock().unwrap();
        maps.has.insert(digest_key(repo, &pushed.digest));
        maps.store_descriptor(&pushed);
        Ok(pushed)
    }

    async fn mount_blob(
        &self,
        from_repo: &str,
        to_repo: &str,
        digest: &Digest,
    ) -> Result<Descriptor, Error> {
        let mounted = self.inner.mount_blob(from_repo, to_repo, digest).await?;
        let mut maps = self.maps.lock().unwrap();
        maps.has.insert(digest_key(to_repo, digest));
        maps.store_descriptor(&mounted);
        Ok(mounted)
    }

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>, Error> {
        self.inner.list_tags(repo).await
    }
}
