use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use indexmap::IndexMap;
use log::info;
use registry::spec::{ANNOTATION_ARCH, ANNOTATION_REF_NAME, Index};
use registry::synthesize::synthesize_index;
use registry::{Clients, Reference};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest as _, Sha256};
use tokio::sync::{mpsc, oneshot};

use crate::Error;

pub const DEFAULT_CONCURRENCY: usize = 1000;

// one source record, as delivered by the pre-ordered input stream: exactly one architecture
// per record, with more architectures of the same source arriving as separate records.
// the parents map is ordered and that order is load-bearing (the build id hashes it)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInput {
    pub source_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub arches: IndexMap<String, SourceArch>,
}

#[derive(Debug, Deserialize)]
pub struct SourceArch {
    #[serde(default)]
    pub parents: IndexMap<String, SourceParent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceParent {
    pub source_id: Option<String>,
    pub pin: Option<String>,
}

// the hashed identity of a build; serialization order of the fields (and of the parents map)
// is exactly what the build id is computed over
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildIdParts {
    pub source_id: String,
    pub arch: String,
    pub parents: IndexMap<String, String>,
}

impl BuildIdParts {
    // hex sha256 of the canonical JSON plus a trailing newline (an older calculation included
    // the newline, and keeping it preserves every already-published build id)
    pub fn build_id(&self) -> Result<String, Error> {
        let mut canonical = serde_json::to_vec(self)?;
        canonical.push(b'\n');
        Ok(hex::encode(Sha256::digest(&canonical)))
    }
}

#[derive(Debug, Serialize)]
struct BuildDetails {
    img: String,
    resolved: Option<Index>,
    #[serde(flatten)]
    parts: BuildIdParts,
    #[serde(rename = "resolvedParents")]
    resolved_parents: IndexMap<String, Index>,
}

#[derive(Debug, Serialize)]
struct BuildRecord {
    #[serde(rename = "buildId")]
    build_id: String,
    build: BuildDetails,
    source: Box<RawValue>,
}

// the on-disk resolve cache: reference string to previously synthesized index. only loaded and
// saved around a complete successful run
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheFile {
    #[serde(default)]
    pub indexes: HashMap<String, Index>,
}

impl CacheFile {
    pub fn load(path: impl AsRef<Path>) -> Result<CacheFile, Error> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CacheFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let mut contents = crate::to_tab_indented_json(self)?;
        contents.push('\n');
        std::fs::write(path, contents)?;
        Ok(())
    }
}

// reference resolution with per-reference single flight: a given reference string is resolved
// against the registry at most once for the lifetime of the process, and concurrent callers
// await the same completion
pub struct Resolver {
    clients: Arc<Clients>,
    cache: moka::future::Cache<String, Option<Arc<Index>>>,
    // Some once a cache file is configured; only by-digest or explicitly-flagged lookups are
    // recorded (tags are mutable across runs, caching them on disk would be wrong)
    save: Mutex<Option<HashMap<String, Index>>>,
}

impl Resolver {
    pub fn new(clients: Arc<Clients>) -> Self {
        Resolver {
            clients,
            cache: moka::future::Cache::builder().build(),
            save: Mutex::new(None),
        }
    }

    pub fn enable_save(&self) {
        *self.save.lock().unwrap() = Some(HashMap::new())
    }

    // seed the in-memory cache from a previously saved cache file
    pub async fn prime(&self, indexes: HashMap<String, Index>) {
        for (ref_string, index) in indexes {
            self.cache.insert(ref_string, Some(Arc::new(index))).await;
        }
    }

    pub fn saved(&self) -> Option<HashMap<String, Index>> {
        self.save.lock().unwrap().take()
    }

    pub async fn resolve_index(
        &self,
        img: &str,
        disk_cache_for_sure: bool,
    ) -> Result<Option<Arc<Index>>, Error> {
        let mut reference = Reference::parse(img).map_err(registry::Error::from)?;
        if reference.digest.is_some() {
            // the reference is the cache key, so an explicit digest makes any tag data noise
            reference.tag = None;
        } else if reference.tag.is_none() {
            reference.tag = Some("latest".to_string());
        }
        let ref_string = reference.to_string();

        let entry = self
            .cache
            .entry(ref_string.clone())
            .or_try_insert_with(async {
                let index = synthesize_index(&self.clients, &reference).await?;
                Ok::<_, registry::Error>(index.map(Arc::new))
            })
            .await
            .map_err(Error::Resolve)?;

        let fresh = entry.is_fresh();
        let Some(index) = entry.into_value() else {
            return Ok(None);
        };

        if fresh {
            let resolved = index
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(ANNOTATION_REF_NAME))
                .map(String::as_str)
                .unwrap_or_default();
            eprintln!(
                "NOTE: lookup {img} -> {}",
                resolved.strip_prefix(ref_string.as_str()).unwrap_or(resolved)
            );
        }

        // if the caller doesn't know this lookup should be cached for sure, the answer is
        // whether it was a by-digest lookup
        if disk_cache_for_sure || reference.digest.is_some() {
            let mut save = self.save.lock().unwrap();
            if let Some(save) = save.as_mut() {
                save.insert(ref_string, (*index).clone());
            }
        }

        Ok(Some(index))
    }

    // resolve and then keep only the entries annotated for the given architecture; None when
    // nothing (or nothing for this arch) is there
    pub async fn resolve_arch_index(
        &self,
        img: &str,
        arch: &str,
        disk_cache_for_sure: bool,
    ) -> Result<Option<Index>, Error> {
        let Some(index) = self.resolve_index(img, disk_cache_for_sure).await? else {
            return Ok(None);
        };

        // a copy so the shared cached index stays untouched for other arch lookups
        let mut index = (*index).clone();
        index
            .manifests
            .retain(|entry| entry.annotation(ANNOTATION_ARCH) == Some(arch));
        if index.manifests.is_empty() {
            return Ok(None);
        }
        Ok(Some(index))
    }
}

type SharedIndex = Option<Arc<Index>>;
type IndexFuture = Shared<BoxFuture<'static, SharedIndex>>;
type SlotResult = Result<Option<(String, String)>, Error>;

#[derive(Clone)]
pub struct Engine {
    pub resolver: Arc<Resolver>,
    staging_template: String,
    concurrency: usize,
}

impl Engine {
    pub fn new(resolver: Arc<Resolver>, staging_template: String) -> Result<Self, Error> {
        if !staging_template.contains("BUILD") {
            return Err(Error::Input(
                "invalid staging template (missing BUILD)".to_string(),
            ));
        }
        Ok(Engine {
            resolver,
            staging_template,
            concurrency: DEFAULT_CONCURRENCY,
        })
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    // consume a stream of source records and write the single output object, keyed by build id
    // and strictly in input order. computation runs out of order: every record gets an in-order
    // slot up front (an inner single-element channel on a bounded outer channel), and each
    // build fills its slot whenever it finishes
    pub async fn run<W: Write>(&self, input: String, out: &mut W) -> Result<(), Error> {
        let (slots_tx, mut slots_rx) = mpsc::channel::<oneshot::Receiver<SlotResult>>(self.concurrency);
        let resolved: Arc<Mutex<HashMap<String, IndexFuture>>> = Arc::default();

        let engine = self.clone();
        let feeder = tokio::spawn(async move {
            let stream = serde_json::Deserializer::from_str(&input).into_iter::<Box<RawValue>>();
            for document in stream {
                let (slot_tx, slot_rx) = oneshot::channel();
                if slots_tx.send(slot_rx).await.is_err() {
                    // the output side bailed; nothing left to do
                    return;
                }

                let source = document
                    .map_err(Error::from)
                    .and_then(|raw| engine.parse_source(raw));
                let (raw, source, arch, parents) = match source {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        // deliver the error through the slot so it surfaces in input order
                        let _ = slot_tx.send(Err(e));
                        return;
                    }
                };

                // register the future *before* computation starts so later siblings always
                // find their parents
                let (result_tx, result_rx) = oneshot::channel::<SharedIndex>();
                let future: IndexFuture = result_rx
                    .map(|received| received.unwrap_or(None))
                    .boxed()
                    .shared();
                resolved
                    .lock()
                    .unwrap()
                    .insert(format!("{}-{arch}", source.source_id), future);

                let engine = engine.clone();
                let resolved = resolved.clone();
                tokio::spawn(async move {
                    match engine.build(raw, source, arch, parents, &resolved).await {
                        Ok(Some((build_id, json, staging))) => {
                            let _ = slot_tx.send(Ok(Some((build_id, json))));
                            let _ = result_tx.send(staging);
                        }
                        Ok(None) => {
                            let _ = slot_tx.send(Ok(None));
                            let _ = result_tx.send(None);
                        }
                        Err(e) => {
                            let _ = result_tx.send(None);
                            let _ = slot_tx.send(Err(e));
                        }
                    }
                });
            }
        });

        write!(out, "{{")?;
        let mut first = true;
        while let Some(slot) = slots_rx.recv().await {
            match slot.await {
                Ok(Ok(Some((build_id, json)))) => {
                    if !first {
                        write!(out, ",")?;
                    }
                    first = false;
                    write!(out, "\n\t{}: {json}", serde_json::to_string(&build_id)?)?;
                }
                // "not yet": this build contributes nothing this run
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    feeder.abort();
                    return Err(e);
                }
                Err(_) => {
                    feeder.abort();
                    return Err(Error::Input("build task died without reporting".to_string()));
                }
            }
        }
        writeln!(out, "\n}}")?;

        let _ = feeder.await;
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn parse_source(
        &self,
        raw: Box<RawValue>,
    ) -> Result<(Box<RawValue>, SourceInput, String, IndexMap<String, SourceParent>), Error> {
        let mut source: SourceInput = serde_json::from_str(raw.get())?;
        if source.arches.len() != 1 {
            return Err(Error::Input(format!(
                "unexpected arches length: {}",
                raw.get()
            )));
        }
        let (arch, arch_details) = source.arches.pop().expect("length checked above");
        Ok((raw, source, arch, arch_details.parents))
    }

    async fn build(
        &self,
        raw: Box<RawValue>,
        source: SourceInput,
        arch: String,
        parents: IndexMap<String, SourceParent>,
        resolved: &Mutex<HashMap<String, IndexFuture>>,
    ) -> Result<Option<(String, String, SharedIndex)>, Error> {
        let first_tag = source.tags.first().map(String::as_str).unwrap_or("").to_string();

        let mut parts = BuildIdParts {
            source_id: source.source_id.clone(),
            arch: arch.clone(),
            parents: IndexMap::new(),
        };
        let mut resolved_parents: IndexMap<String, Index> = IndexMap::new();

        for (alias, parent) in &parents {
            if alias == "scratch" {
                continue;
            }

            let parent_index = match &parent.source_id {
                Some(parent_source_id) => {
                    // the input is topologically ordered, so the producer of this key has
                    // already been registered; anything else is a broken input
                    let future = resolved
                        .lock()
                        .unwrap()
                        .get(&format!("{parent_source_id}-{arch}"))
                        .cloned()
                        .unwrap_or_else(|| {
                            panic!(
                                "parent of {} on {arch} should be {parent_source_id} but that sourceId is unknown to us!",
                                source.source_id
                            )
                        });
                    future.await.map(|index| (*index).clone())
                }
                None => {
                    let mut img = alias.clone();
                    if let Some(pin) = &parent.pin {
                        img = format!("{img}@{pin}");
                    }
                    self.resolver.resolve_arch_index(&img, &arch, false).await?
                }
            };

            let Some(parent_index) = parent_index else {
                eprintln!("{} ({first_tag}) -> not yet! [{arch}]", source.source_id);
                return Ok(None);
            };

            parts.parents.insert(
                alias.clone(),
                parent_index.manifests[0].digest.to_string(),
            );
            resolved_parents.insert(alias.clone(), parent_index);
        }

        let build_id = parts.build_id()?;
        eprintln!("{} ({first_tag}) -> {build_id} [{arch}]", source.source_id);

        let img = self
            .staging_template
            .replace("BUILD", &build_id)
            .replace("ARCH", &arch);
        info!("staging image for {}-{arch} is {img}", source.source_id);

        let staging = self.resolver.resolve_arch_index(&img, &arch, true).await?;

        let record = BuildRecord {
            build_id: build_id.clone(),
            build: BuildDetails {
                img,
                resolved: staging.clone(),
                parts,
                resolved_parents,
            },
            source: raw,
        };
        let json = serde_json::to_string(&record)?;

        Ok(Some((build_id, json, staging.map(Arc::new))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry::mem::MemRegistry;
    use registry::spec::{MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST};
    use serde_json::json;

    fn offline_engine(mem: &MemRegistry, staging_template: &str) -> Engine {
        let clients = Clients::offline();
        clients.register("localhost:5000", Arc::new(mem.clone()));
        let resolver = Arc::new(Resolver::new(Arc::new(clients)));
        Engine::new(resolver, staging_template.to_string()).unwrap()
    }

    async fn run_to_json(engine: &Engine, input: &str) -> serde_json::Value {
        let mut out = Vec::new();
        engine.run(input.to_string(), &mut out).await.unwrap();
        serde_json::from_slice(&out).unwrap()
    }

    fn expected_build_id(canonical: &str) -> String {
        let mut bytes = canonical.as_bytes().to_vec();
        bytes.push(b'\n');
        hex::encode(Sha256::digest(&bytes))
    }

    // an image manifest plus a single-entry index tagged (or digested) into the repo; returns
    // (index descriptor, manifest digest)
    fn seed_arch_index(
        mem: &MemRegistry,
        repo: &str,
        tag: Option<&str>,
        arch: &str,
    ) -> (registry::spec::Descriptor, registry::Digest) {
        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "layers": [],
        }))
        .unwrap();
        let manifest_descriptor = mem.seed_manifest(repo, None, &manifest, MEDIA_TYPE_OCI_MANIFEST);
        let index = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_INDEX,
            "manifests": [{
                "mediaType": MEDIA_TYPE_OCI_MANIFEST,
                "digest": manifest_descriptor.digest.as_str(),
                "size": manifest.len(),
                "platform": {"architecture": arch, "os": "linux"},
            }],
        }))
        .unwrap();
        let index_descriptor = mem.seed_manifest(repo, tag, &index, MEDIA_TYPE_OCI_INDEX);
        (index_descriptor, manifest_descriptor.digest)
    }

    #[test]
    fn test_ordered_parents_in_build_id() {
        let mut forward = BuildIdParts {
            source_id: "S".to_string(),
            arch: "amd64".to_string(),
            parents: IndexMap::new(),
        };
        forward.parents.insert("a".to_string(), "sha256:aaa".to_string());
        forward.parents.insert("b".to_string(), "sha256:bbb".to_string());

        let mut reversed = BuildIdParts {
            source_id: "S".to_string(),
            arch: "amd64".to_string(),
            parents: IndexMap::new(),
        };
        reversed.parents.insert("b".to_string(), "sha256:bbb".to_string());
        reversed.parents.insert("a".to_string(), "sha256:aaa".to_string());

        // insertion order is part of the identity
        assert_ne!(forward.build_id().unwrap(), reversed.build_id().unwrap());

        // and so is every resolved digest
        let mut changed = forward.clone();
        changed.parents.insert("b".to_string(), "sha256:ccc".to_string());
        assert_ne!(forward.build_id().unwrap(), changed.build_id().unwrap());

        // but recomputing is stable
        assert_eq!(forward.build_id().unwrap(), forward.build_id().unwrap());
    }

    #[test]
    fn test_ordered_map_semantics() {
        let mut map: IndexMap<String, String> = IndexMap::new();
        map.insert("c".to_string(), "1".to_string());
        map.insert("b".to_string(), "2".to_string());
        map.insert("a".to_string(), "3".to_string());
        assert_eq!(
            serde_json::to_string(&map).unwrap(),
            r#"{"c":"1","b":"2","a":"3"}"#
        );

        // updating an existing key keeps its position
        map.insert("c".to_string(), "9".to_string());
        assert_eq!(
            serde_json::to_string(&map).unwrap(),
            r#"{"c":"9","b":"2","a":"3"}"#
        );

        // duplicate keys during deserialization: first position, last value
        let parsed: IndexMap<String, String> =
            serde_json::from_str(r#"{"foo":"foo","bar":"bar","foo":"baz"}"#).unwrap();
        assert_eq!(
            serde_json::to_string(&parsed).unwrap(),
            r#"{"foo":"baz","bar":"bar"}"#
        );
    }

    #[tokio::test]
    async fn test_scratch_root_build() {
        let mem = MemRegistry::new();
        let engine = offline_engine(&mem, "localhost:5000/staging-ARCH:BUILD");

        let input = r#"{"sourceId":"S","tags":["s:latest"],"arches":{"amd64":{"parents":{"scratch":{}}}}}"#;
        let output = run_to_json(&engine, input).await;

        let expected = expected_build_id(r#"{"sourceId":"S","arch":"amd64","parents":{}}"#);
        let record = output
            .get(&expected)
            .unwrap_or_else(|| panic!("expected buildId {expected} in {output}"));
        assert_eq!(record["buildId"], json!(expected));
        assert_eq!(record["build"]["sourceId"], json!("S"));
        assert_eq!(record["build"]["arch"], json!("amd64"));
        assert_eq!(record["build"]["parents"], json!({}));
        assert_eq!(record["build"]["resolvedParents"], json!({}));
        // nothing staged yet
        assert_eq!(record["build"]["resolved"], json!(null));
        assert_eq!(
            record["build"]["img"],
            json!(format!("localhost:5000/staging-amd64:{expected}"))
        );
        assert_eq!(record["source"], serde_json::from_str::<serde_json::Value>(input).unwrap());
    }

    #[tokio::test]
    async fn test_pinned_parent_resolved_once() {
        let mem = MemRegistry::new();
        let (index_descriptor, manifest_digest) = seed_arch_index(&mem, "base", None, "amd64");
        let engine = offline_engine(&mem, "localhost:5000/staging-ARCH:BUILD");

        // two records pinning the same parent; the resolve happens exactly once
        let record = |source_id: &str| {
            format!(
                r#"{{"sourceId":"{source_id}","tags":["{source_id}:latest"],"arches":{{"amd64":{{"parents":{{"localhost:5000/base":{{"pin":"{}"}}}}}}}}}}"#,
                index_descriptor.digest
            )
        };
        let input = format!("{}\n{}", record("S1"), record("S2"));
        let output = run_to_json(&engine, &input).await;

        assert_eq!(output.as_object().unwrap().len(), 2);
        for record in output.as_object().unwrap().values() {
            assert_eq!(
                record["build"]["parents"]["localhost:5000/base"],
                json!(manifest_digest.as_str())
            );
        }
        assert_eq!(
            mem.fetch_count(&format!("get_manifest base@{}", index_descriptor.digest)),
            1
        );
    }

    #[tokio::test]
    async fn test_in_graph_parent_not_yet() {
        let mem = MemRegistry::new();
        let engine = offline_engine(&mem, "localhost:5000/staging-ARCH:BUILD");

        let input = concat!(
            r#"{"sourceId":"S1","tags":["s1:latest"],"arches":{"amd64":{"parents":{"scratch":{}}}}}"#,
            "\n",
            r#"{"sourceId":"S2","tags":["s2:latest"],"arches":{"amd64":{"parents":{"base":{"sourceId":"S1"}}}}}"#,
        );
        let output = run_to_json(&engine, input).await;

        // S1's staging image has not been pushed, so S2 emits nothing this run
        let s1_id = expected_build_id(r#"{"sourceId":"S1","arch":"amd64","parents":{}}"#);
        let keys: Vec<&String> = output.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec![&s1_id]);
    }

    #[tokio::test]
    async fn test_in_graph_parent_resolves_through_staging() {
        let mem = MemRegistry::new();

        // pre-stage S1's build output so S2 can chain off it
        let s1_id = expected_build_id(r#"{"sourceId":"S1","arch":"amd64","parents":{}}"#);
        let (_, staged_manifest_digest) =
            seed_arch_index(&mem, "staging-amd64", Some(&s1_id), "amd64");

        let engine = offline_engine(&mem, "localhost:5000/staging-ARCH:BUILD");
        let input = concat!(
            r#"{"sourceId":"S1","tags":["s1:latest"],"arches":{"amd64":{"parents":{"scratch":{}}}}}"#,
            "\n",
            r#"{"sourceId":"S2","tags":["s2:latest"],"arches":{"amd64":{"parents":{"base":{"sourceId":"S1"}}}}}"#,
        );
        let output = run_to_json(&engine, input).await;
        let records = output.as_object().unwrap();
        assert_eq!(records.len(), 2);

        // output preserves input order
        let keys: Vec<&String> = records.keys().collect();
        assert_eq!(keys[0], &s1_id);

        let s2 = &records[keys[1].as_str()];
        assert_eq!(
            s2["build"]["parents"]["base"],
            json!(staged_manifest_digest.as_str())
        );
        // S2's build id hashes S1's staged manifest digest
        let s2_canonical = format!(
            r#"{{"sourceId":"S2","arch":"amd64","parents":{{"base":"{staged_manifest_digest}"}}}}"#
        );
        assert_eq!(keys[1], &expected_build_id(&s2_canonical));
    }

    #[tokio::test]
    async fn test_cache_file_round_trip() {
        let dir = std::env::temp_dir().join(format!("builds-cache-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cache.json");

        let mem = MemRegistry::new();
        let (index_descriptor, _) = seed_arch_index(&mem, "base", None, "amd64");
        let clients = Clients::offline();
        clients.register("localhost:5000", Arc::new(mem.clone()));
        let resolver = Resolver::new(Arc::new(clients));
        resolver.enable_save();

        let img = format!("localhost:5000/base@{}", index_descriptor.digest);
        resolver.resolve_index(&img, false).await.unwrap().unwrap();

        let saved = resolver.saved().unwrap();
        // by-digest lookups are persisted
        assert_eq!(saved.len(), 1);
        CacheFile { indexes: saved }.save(&path).unwrap();

        let loaded = CacheFile::load(&path).unwrap();
        assert_eq!(loaded.indexes.len(), 1);

        // a primed resolver answers without touching the registry
        let fresh_clients = Clients::offline();
        let resolver = Resolver::new(Arc::new(fresh_clients));
        resolver.prime(loaded.indexes).await;
        assert!(resolver.resolve_index(&img, false).await.unwrap().is_some());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_tag_only_lookups_not_persisted() {
        let mem = MemRegistry::new();
        seed_arch_index(&mem, "base", Some("latest"), "amd64");
        let clients = Clients::offline();
        clients.register("localhost:5000", Arc::new(mem.clone()));
        let resolver = Resolver::new(Arc::new(clients));
        resolver.enable_save();

        resolver
            .resolve_index("localhost:5000/base:latest", false)
            .await
            .unwrap()
            .unwrap();
        assert!(resolver.saved().unwrap().is_empty());
    }
}
