use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::client::{Error, ObjectReader, Registry, data_matches_digest};
use crate::digest::Digest;
use crate::spec::{Descriptor, ManifestChildren, MEDIA_TYPE_OCTET_STREAM, is_manifest_media_type};

// a small in-memory registry. it backs the test suites (sitting under the cache, the lookup
// facade, the synthesizer, and the push planner), and it behaves like a real registry in the
// one way that matters for the planner: a manifest push is rejected with a typed error while
// any of its children are missing

#[derive(Default)]
struct State {
    // repo => digest => (descriptor, bytes)
    manifests: HashMap<String, HashMap<Digest, (Descriptor, Bytes)>>,
    // repo => tag => digest
    tags: HashMap<String, HashMap<String, Digest>>,
    // repo => digest => bytes
    blobs: HashMap<String, HashMap<Digest, Bytes>>,
    // "op key" => count, for asserting how often upstream was actually hit
    fetches: HashMap<String, u64>,
}

#[derive(Clone, Default)]
pub struct MemRegistry {
    state: Arc<Mutex<State>>,
}

impl MemRegistry {
    pub fn new() -> Self {
        MemRegistry::default()
    }

    pub fn seed_manifest(
        &self,
        repo: &str,
        tag: Option<&str>,
        data: &[u8],
        media_type: &str,
    ) -> Descriptor {
        let digest = Digest::from_bytes(data);
        let descriptor = Descriptor::new(media_type, digest.clone(), data.len() as u64);
        let mut state = self.state.lock().unwrap();
        state
            .manifests
            .entry(repo.to_string())
            .or_default()
            .insert(digest.clone(), (descriptor.clone(), Bytes::copy_from_slice(data)));
        if let Some(tag) = tag {
            state
                .tags
                .entry(repo.to_string())
                .or_default()
                .insert(tag.to_string(), digest);
        }
        descriptor
    }

    pub fn seed_blob(&self, repo: &str, data: &[u8]) -> Descriptor {
        let digest = Digest::from_bytes(data);
        let mut state = self.state.lock().unwrap();
        state
            .blobs
            .entry(repo.to_string())
            .or_default()
            .insert(digest.clone(), Bytes::copy_from_slice(data));
        Descriptor::new(MEDIA_TYPE_OCTET_STREAM, digest, data.len() as u64)
    }

    pub fn fetch_count(&self, key: &str) -> u64 {
        *self.state.lock().unwrap().fetches.get(key).unwrap_or(&0)
    }

    pub fn has_manifest(&self, repo: &str, digest: &Digest) -> bool {
        self.state
            .lock()
            .unwrap()
            .manifests
            .get(repo)
            .is_some_and(|m| m.contains_key(digest))
    }

    pub fn has_blob(&self, repo: &str, digest: &Digest) -> bool {
        self.state
            .lock()
            .unwrap()
            .blobs
            .get(repo)
            .is_some_and(|b| b.contains_key(digest))
    }

    pub fn tagged_digest(&self, repo: &str, tag: &str) -> Option<Digest> {
        self.state
            .lock()
            .unwrap()
            .tags
            .get(repo)
            .and_then(|t| t.get(tag))
            .cloned()
    }

    fn count(state: &mut State, key: String) {
        *state.fetches.entry(key).or_insert(0) += 1;
    }
}

#[async_trait]
impl Registry for MemRegistry {
    async fn get_manifest(&self, repo: &str, digest: &Digest) -> Result<ObjectReader, Error> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, format!("get_manifest {repo}@{digest}"));
        let repo_manifests = state.manifests.get(repo).ok_or(Error::NameUnknown)?;
        let (descriptor, data) = repo_manifests.get(digest).ok_or(Error::ManifestUnknown)?;
        Ok(ObjectReader::from_bytes(descriptor.clone(), data.clone()))
    }

    async fn get_tag(&self, repo: &str, tag: &str) -> Result<ObjectReader, Error> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, format!("get_tag {repo}:{tag}"));
        let digest = state
            .tags
            .get(repo)
            .and_then(|tags| tags.get(tag))
            .cloned()
            .ok_or(Error::ManifestUnknown)?;
        let (descriptor, data) = state
            .manifests
            .get(repo)
            .and_then(|m| m.get(&digest))
            .ok_or(Error::ManifestUnknown)?;
        Ok(ObjectReader::from_bytes(descriptor.clone(), data.clone()))
    }

    async fn get_blob(&self, repo: &str, digest: &Digest) -> Result<ObjectReader, Error> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, format!("get_blob {repo}@{digest}"));
        let repo_blobs = state.blobs.get(repo).ok_or(Error::NameUnknown)?;
        let data = repo_blobs.get(digest).ok_or(Error::BlobUnknown)?;
        Ok(ObjectReader::from_bytes(
            Descriptor::new(MEDIA_TYPE_OCTET_STREAM, digest.clone(), data.len() as u64),
            data.clone(),
        ))
    }

    async fn resolve_manifest(&self, repo: &str, digest: &Digest) -> Result<Descriptor, Error> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, format!("resolve_manifest {repo}@{digest}"));
        state
            .manifests
            .get(repo)
            .and_then(|m| m.get(digest))
            .map(|(descriptor, _)| descriptor.clone())
            .ok_or(Error::ManifestUnknown)
    }

    async fn resolve_tag(&self, repo: &str, tag: &str) -> Result<Descriptor, Error> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, format!("resolve_tag {repo}:{tag}"));
        let digest = state
            .tags
            .get(repo)
            .and_then(|tags| tags.get(tag))
            .cloned()
            .ok_or(Error::ManifestUnknown)?;
        state
            .manifests
            .get(repo)
            .and_then(|m| m.get(&digest))
            .map(|(descriptor, _)| descriptor.clone())
            .ok_or(Error::ManifestUnknown)
    }

    async fn resolve_blob(&self, repo: &str, digest: &Digest) -> Result<Descriptor, Error> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, format!("resolve_blob {repo}@{digest}"));
        let data = state
            .blobs
            .get(repo)
            .and_then(|b| b.get(digest))
            .ok_or(Error::BlobUnknown)?;
        Ok(Descriptor::new(
            MEDIA_TYPE_OCTET_STREAM,
            digest.clone(),
            data.len() as u64,
        ))
    }

    async fn push_manifest(
        &self,
        repo: &str,
        reference: &str,
        data: &[u8],
        media_type: &str,
    ) -> Result<Descriptor, Error> {
        // like a real registry, refuse the push while children are missing
        if let Ok(children) = ManifestChildren::parse(data) {
            let state = self.state.lock().unwrap();
            for child in children.into_children() {
                if child.has_urls() {
                    // foreign layers live elsewhere and are never pushed
                    continue;
                }
                let present = if is_manifest_media_type(&child.media_type) {
                    state
                        .manifests
                        .get(repo)
                        .is_some_and(|m| m.contains_key(&child.digest))
                } else {
                    state
                        .blobs
                        .get(repo)
                        .is_some_and(|b| b.contains_key(&child.digest))
                };
                if !present {
                    return Err(Error::ManifestBlobUnknown);
                }
            }
        }

        let digest = Digest::from_bytes(data);
        if let Ok(by_digest) = Digest::parse(reference) {
            if by_digest != digest {
                return Err(Error::DigestMismatch {
                    expected: by_digest,
                    actual: digest,
                });
            }
        }
        let descriptor = Descriptor::new(media_type, digest.clone(), data.len() as u64);
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, format!("push_manifest {repo}:{reference}"));
        state
            .manifests
            .entry(repo.to_string())
            .or_default()
            .insert(digest.clone(), (descriptor.clone(), Bytes::copy_from_slice(data)));
        if Digest::parse(reference).is_err() {
            state
                .tags
                .entry(repo.to_string())
                .or_default()
                .insert(reference.to_string(), digest);
        }
        Ok(descriptor)
    }

    async fn push_blob(
        &self,
        repo: &str,
        descriptor: &Descriptor,
        body: ObjectReader,
    ) -> Result<Descriptor, Error> {
        let data = body.bytes().await?;
        if !data_matches_digest(&descriptor.digest, &data) {
            return Err(Error::DigestMismatch {
                expected: descriptor.digest.clone(),
                actual: Digest::from_bytes(&data),
            });
        }
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, format!("push_blob {repo}@{}", descriptor.digest));
        state
            .blobs
            .entry(repo.to_string())
            .or_default()
            .insert(descriptor.digest.clone(), data);
        Ok(Descriptor::new(
            descriptor.media_type.clone(),
            descriptor.digest.clone(),
            descriptor.size,
        ))
    }

    async fn mount_blob(
        &self,
        from_repo: &str,
        to_repo: &str,
        digest: &Digest,
    ) -> Result<Descriptor, Error> {
        let mut state = self.state.lock().unwrap();
        Self::count(
            &mut state,
            format!("mount_blob {to_repo}@{digest}<-{from_repo}"),
        );
        let data = state
            .blobs
            .get(from_repo)
            .and_then(|b| b.get(digest))
            .cloned()
            .ok_or(Error::BlobUnknown)?;
        let size = data.len() as u64;
        state
            .blobs
            .entry(to_repo.to_string())
            .or_default()
            .insert(digest.clone(), data);
        Ok(Descriptor::new(MEDIA_TYPE_OCTET_STREAM, digest.clone(), size))
    }

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>, Error> {
        let state = self.state.lock().unwrap();
        let mut tags: Vec<String> = state
            .tags
            .get(repo)
            .map(|tags| tags.keys().cloned().collect())
            .unwrap_or_default();
        tags.sort();
        Ok(tags)
    }
}
