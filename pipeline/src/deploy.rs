use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use log::{error, info};
use registry::spec::ManifestChildren;
use registry::{Clients, Digest, Reference};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinSet;

use crate::Error;
use crate::input::{DeployType, NormalizedInput, RawInput, normalize};

// per-destination-object read/write locks, lazily populated. an input write-locks the object it
// pushes and read-locks every object it depends on, so a parent's push always waits out the
// pushes of its children. correctness additionally requires the input stream to arrive
// children before parents; that precondition is the caller's to uphold, not ours to detect
#[derive(Default)]
struct LockMap(Mutex<HashMap<String, Arc<RwLock<()>>>>);

impl LockMap {
    fn get(&self, key: &str) -> Arc<RwLock<()>> {
        self.0
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

struct Guards {
    write: Option<OwnedRwLockWriteGuard<()>>,
    reads: Vec<OwnedRwLockReadGuard<()>>,
}

fn object_key(reference: &Reference, digest: &Digest) -> String {
    format!("{}/{}@{digest}", reference.host, reference.repository)
}

// every object key this input depends on: sibling refs of the same digest, any child digest
// mentioned by the data, and every digest in the lookup table
fn read_keys(normal: &NormalizedInput) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();

    let refs_digest = normal.refs[0].digest.clone();
    if let Some(digest) = &refs_digest {
        for reference in &normal.refs[1..] {
            keys.insert(object_key(reference, digest));
        }
    }

    let mut child_digests: Vec<Digest> = Vec::new();
    if normal.op_type == DeployType::Manifest {
        if let Some(data) = &normal.data {
            if let Ok(children) = ManifestChildren::parse(data) {
                child_digests.extend(children.into_children().into_iter().map(|c| c.digest));
            }
        }
    }
    for key in normal.lookup.keys() {
        if let Ok(digest) = Digest::parse(key) {
            child_digests.push(digest);
        }
    }
    for digest in &child_digests {
        for reference in &normal.refs {
            keys.insert(object_key(reference, digest));
        }
    }

    keys
}

// lock acquisition happens here, in input order and in stable key order, before the push task
// is spawned; that sequencing is what makes the children-first input ordering effective
async fn acquire(locks: &LockMap, normal: &NormalizedInput) -> Guards {
    let write_key = normal.refs[0]
        .digest
        .as_ref()
        .map(|digest| object_key(&normal.refs[0], digest));

    let mut keys = read_keys(normal);
    if let Some(write_key) = &write_key {
        keys.insert(write_key.clone());
    }

    let mut guards = Guards {
        write: None,
        reads: Vec::new(),
    };
    for key in keys {
        let lock = locks.get(&key);
        if Some(&key) == write_key.as_ref() {
            guards.write = Some(lock.write_owned().await);
        } else {
            guards.reads.push(lock.read_owned().await);
        }
    }
    guards
}

async fn deploy_one(
    clients: Arc<Clients>,
    normal: NormalizedInput,
    mut guards: Guards,
) -> Result<(), Error> {
    let refs_digest = normal.refs[0].digest.clone();

    for (position, reference) in normal.refs.iter().enumerate() {
        match &normal.copy_from {
            None => {
                let digest = refs_digest
                    .as_ref()
                    .map(|d| d.to_string())
                    .unwrap_or_default();
                println!("{reference}: pushing {} {digest}", normal.op_type);
            }
            Some(source) => println!("{reference}: copying {} from {source}", normal.op_type),
        }

        match normal.execute(&clients, reference).await {
            Ok(descriptor) => {
                if reference.digest.is_none() && refs_digest.is_none() {
                    println!("{reference}: done @{}", descriptor.digest);
                } else {
                    println!("{reference}: done");
                }
            }
            Err(e) => {
                error!("{reference}: {e}");
                eprintln!("{reference}: ERROR: {e}");
                return Err(e.into());
            }
        }

        if position == 0 {
            // the object now exists; later-input dependents only need it present, so the
            // exclusive hold relaxes into a shared one while the remaining tags push
            if let Some(write) = guards.write.take() {
                guards.reads.push(write.downgrade());
            }
        }
    }
    Ok(())
}

// run a stream of raw push/copy requests. documents must arrive children-first; each document
// is normalized up front and pushed concurrently, coordinated only by the lock graph
pub async fn run(clients: Arc<Clients>, inputs: Vec<RawInput>) -> Result<(), Error> {
    let locks = LockMap::default();
    let mut tasks: JoinSet<Result<(), Error>> = JoinSet::new();

    for raw in &inputs {
        let normal = normalize(raw)?;
        info!(
            "deploying {} to {} ref(s), starting with {}",
            normal.op_type,
            normal.refs.len(),
            normal.refs[0]
        );
        let guards = acquire(&locks, &normal).await;
        tasks.spawn(deploy_one(clients.clone(), normal, guards));
    }

    let mut failed = false;
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(_)) => failed = true,
            Err(join_error) => {
                error!("deploy task failed: {join_error}");
                failed = true;
            }
        }
    }
    if failed {
        return Err(Error::DeployFailed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry::mem::MemRegistry;
    use registry::spec::{MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_MANIFEST};
    use serde_json::json;

    fn clients_with(mem: &MemRegistry) -> Arc<Clients> {
        let clients = Clients::offline();
        clients.register("localhost:5000", Arc::new(mem.clone()));
        Arc::new(clients)
    }

    // RawValue fields only deserialize out of serde_json's text deserializer
    fn raw(json: serde_json::Value) -> RawInput {
        serde_json::from_str(&json.to_string()).unwrap()
    }

    // children arrive before the parent; the parent's first push succeeds because the lock
    // graph makes it wait for its children, and nothing has to be re-copied
    #[tokio::test]
    async fn test_children_first_stream() {
        let mem = MemRegistry::new();
        let clients = clients_with(&mem);

        let config = br#"{"architecture":"amd64","os":"linux"}"#;
        let config_digest = Digest::from_bytes(config);
        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "config": {
                "mediaType": MEDIA_TYPE_OCI_CONFIG,
                "digest": config_digest.as_str(),
                "size": config.len(),
            },
            "layers": [],
        }))
        .unwrap();
        let manifest_digest = Digest::from_bytes(&manifest);

        let inputs = vec![
            raw(json!({
                "type": "blob",
                "refs": [format!("localhost:5000/app@{config_digest}")],
                "data": base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    config,
                ),
            })),
            raw(json!({
                "type": "manifest",
                "refs": ["localhost:5000/app:latest", "localhost:5000/app:1.0"],
                "data": serde_json::from_slice::<serde_json::Value>(&manifest).unwrap(),
            })),
        ];

        run(clients, inputs).await.unwrap();

        assert!(mem.has_blob("app", &config_digest));
        assert!(mem.has_manifest("app", &manifest_digest));
        assert_eq!(mem.tagged_digest("app", "latest"), Some(manifest_digest.clone()));
        assert_eq!(mem.tagged_digest("app", "1.0"), Some(manifest_digest.clone()));
        // the manifest push never had to fail and re-copy children
        assert_eq!(mem.fetch_count("push_manifest app:latest"), 1);
    }

    #[tokio::test]
    async fn test_failed_deploy_reports() {
        let mem = MemRegistry::new();
        let clients = clients_with(&mem);

        // a copy whose source does not exist
        let inputs = vec![raw(json!({
            "type": "manifest",
            "refs": ["localhost:5000/app:latest"],
            "lookup": {"": "localhost:5000/missing:latest"},
        }))];

        assert!(matches!(
            run(clients, inputs).await,
            Err(Error::DeployFailed)
        ));
    }

    #[test]
    fn test_read_keys_cover_dependencies() {
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "config": {
                "mediaType": MEDIA_TYPE_OCI_CONFIG,
                "digest": "sha256:690912094c0165c489f874c72cee4ba208c28992c0699fa6e10d8cc59f93fec9",
                "size": 2,
            },
            "layers": [],
        });
        let input = raw(json!({
            "type": "manifest",
            "refs": ["localhost:5000/app:latest"],
            "lookup": {"sha256:4c74d744397d4bcbd3079d9c82a87b80d43da376313772978134d1288f20518c": "localhost:5000/src"},
            "data": manifest,
        }));
        let normal = normalize(&input).unwrap();
        let keys = read_keys(&normal);
        // the config child and the lookup entry are both covered
        assert!(keys.iter().any(|k| k.contains("sha256:690912094c0165")));
        assert!(keys.iter().any(|k| k.contains("sha256:4c74d744397d4b")));
    }
}
