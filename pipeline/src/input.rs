use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use registry::push::{LookupMap, copy_blob, copy_manifest, ensure_blob, ensure_manifest};
use registry::spec::{Descriptor, MEDIA_TYPE_OCTET_STREAM};
use registry::{Clients, Digest, ObjectReader, Reference};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::Error;

// see the tests at the bottom for example use cases (pushing images/indexes, pushing blobs,
// copying images/indexes/blobs)

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployType {
    Manifest,
    Blob,
}

impl std::fmt::Display for DeployType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            DeployType::Manifest => "manifest",
            DeployType::Blob => "blob",
        })
    }
}

// a raw push/copy request, as read off the deploy input stream
#[derive(Debug, Deserialize)]
pub struct RawInput {
    // which type of thing we're pushing ("manifest" or "blob")
    #[serde(rename = "type", default)]
    pub op_type: Option<String>,

    // where to push the thing ("jsmith/example:latest", "jsmith/example@sha256:xxx", etc)
    #[serde(default)]
    pub refs: Option<Vec<String>>,

    // where to find any children if we need to copy them (pushing an index and needing the
    // child manifests, pushing a manifest and needing blobs, etc), or the object to copy
    #[serde(default)]
    pub lookup: BTreeMap<String, String>,

    // the data to push; a JSON string is a raw base64-encoded byte stream pushed as-is,
    // anything else is pushed as JSON; absent data means "copy"
    #[serde(default)]
    pub data: Option<Box<RawValue>>,
}

// RawInput with everything inferred made explicit
#[derive(Debug, Serialize, PartialEq)]
pub struct NormalizedInput {
    #[serde(rename = "type")]
    pub op_type: DeployType,
    pub refs: Vec<Reference>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub lookup: BTreeMap<String, Reference>,

    // data and copy_from are mutually exclusive
    #[serde(with = "base64_option")]
    pub data: Option<Vec<u8>>,
    #[serde(rename = "copyFrom")]
    pub copy_from: Option<Reference>,

    // for non-copy manifest pushes: the mediaType extracted out of the data
    #[serde(skip)]
    pub media_type: Option<String>,
}

mod base64_option {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(data) => serializer.serialize_str(&STANDARD.encode(data)),
            None => serializer.serialize_none(),
        }
    }
}

fn normalize_refs(
    op_type: DeployType,
    raw_refs: &[String],
) -> Result<(Vec<Reference>, Option<Digest>), Error> {
    let mut refs = Vec::with_capacity(raw_refs.len());
    // if any ref has a digest, they all have to have the same digest (and the data has to match)
    let mut common_digest: Option<Digest> = None;
    for raw in raw_refs {
        let reference = Reference::parse(raw)
            .map_err(|e| Error::Input(format!("{raw}: failed to parse ref: {e}")))?;

        if let Some(digest) = &reference.digest {
            match &common_digest {
                None => common_digest = Some(digest.clone()),
                Some(common) if common != digest => {
                    return Err(Error::Input(format!(
                        "refs digest mismatch in {reference}: {common}"
                    )));
                }
                Some(_) => {}
            }
        }

        if op_type == DeployType::Blob && reference.tag.is_some() {
            return Err(Error::Input(format!("cannot push blobs to a tag: {reference}")));
        }

        refs.push(reference);
    }
    Ok((refs, common_digest))
}

fn normalize_lookup(
    raw_lookup: &BTreeMap<String, String>,
) -> Result<(BTreeMap<String, Reference>, Option<String>), Error> {
    let mut lookup = BTreeMap::new();
    for (key, raw_ref) in raw_lookup {
        if !key.is_empty() {
            // lookup[""] is a special case for fallback (where to look for any child object
            // that isn't explicitly referenced); everything else must be a digest
            Digest::parse(key)
                .map_err(|e| Error::Input(format!("lookup key {key:?} invalid: {e}")))?;
        }
        let mut reference = Reference::parse(raw_ref)
            .map_err(|e| Error::Input(format!("failed to parse lookup ref {raw_ref:?}: {e}")))?;

        if reference.digest.is_none() && !key.is_empty() {
            reference.digest = Some(Digest::parse(key).unwrap());
        }
        if !key.is_empty() && reference.digest.as_ref().map(|d| d.as_str()) != Some(key.as_str()) {
            return Err(Error::Input(format!(
                "digest on lookup ref should either be omitted or match key: {reference} vs {key}"
            )));
        }

        lookup.insert(key.clone(), reference);
    }

    // a single entry is unambiguous enough to be the copy source; report its key so the
    // caller can use it (a bare fallback with neither tag nor digest isn't)
    if lookup.len() != 1 {
        return Ok((lookup, None));
    }
    let (key, reference) = lookup.iter().next().unwrap();
    if key.is_empty() && reference.digest.is_none() && reference.tag.is_none() {
        return Ok((lookup, None));
    }
    let key = key.clone();
    Ok((lookup, Some(key)))
}

pub fn normalize(raw: &RawInput) -> Result<NormalizedInput, Error> {
    let op_type = match raw.op_type.as_deref() {
        None | Some("") => return Err(Error::Input("missing type".to_string())),
        Some("manifest") => DeployType::Manifest,
        Some("blob") => DeployType::Blob,
        Some(other) => return Err(Error::Input(format!("unknown type: {other}"))),
    };

    let raw_refs = raw
        .refs
        .as_ref()
        .ok_or_else(|| Error::Input("missing refs entirely (JSON input glitch?)".to_string()))?;
    if raw_refs.is_empty() {
        return Err(Error::Input(
            "zero refs specified for pushing (need at least one)".to_string(),
        ));
    }
    let (mut refs, mut refs_digest) = normalize_refs(op_type, raw_refs)?;

    // used for annotating errors from here on out
    let debug_id = refs[0].to_string();

    let (mut lookup, mut lookup_digest) =
        normalize_lookup(&raw.lookup).map_err(|e| Error::Input(format!("{debug_id}: {e}")))?;

    let mut copy_from: Option<Reference> = None;
    let mut data: Option<Vec<u8>> = None;

    let raw_data = raw.data.as_deref().filter(|value| value.get() != "null");
    match raw_data {
        None => {
            // no data; see if there is enough information to infer an object to copy
            if let (Some(refs_d), Some(reference)) = (
                &refs_digest,
                refs_digest
                    .as_ref()
                    .and_then(|d| lookup.get(d.as_str())),
            ) {
                // one of the refs had a digest *and* the lookup knows that digest
                lookup_digest = Some(refs_d.as_str().to_string());
                copy_from = Some(reference.clone());
            } else if let Some(key) = &lookup_digest {
                // the lookup had exactly one usable entry, so that's the one
                copy_from = Some(lookup[key].clone());
            } else if let (Some(refs_d), Some(reference)) = (&refs_digest, lookup.get("")) {
                // fallback entry plus a digest from the refs
                lookup_digest = Some(refs_d.as_str().to_string());
                copy_from = Some(reference.with_digest(refs_d.clone()));
            } else {
                return Err(Error::Input(format!(
                    "{debug_id}: missing data (and lookup is not a single item or fallback with digest or tag)"
                )));
            }

            let copy_from_ref = copy_from.as_mut().unwrap();
            if lookup_digest.as_deref() == Some("") {
                if let Some(digest) = &copy_from_ref.digest {
                    lookup_digest = Some(digest.as_str().to_string());
                }
            }

            // if there is no fallback yet, this ref is it
            lookup
                .entry(String::new())
                .or_insert_with(|| copy_from_ref.clone());

            let lookup_digest = lookup_digest.as_deref().unwrap_or_default().to_string();
            if let Some(refs_d) = &refs_digest {
                if !lookup_digest.is_empty() && refs_d.as_str() != lookup_digest {
                    return Err(Error::Input(format!(
                        "{debug_id}: copy-by-digest mismatch: {refs_d} vs {copy_from_ref}"
                    )));
                }
            } else if !lookup_digest.is_empty() {
                let digest = Digest::parse(&lookup_digest)
                    .map_err(|e| Error::Input(format!("{debug_id}: {e}")))?;
                refs_digest = Some(digest);
            }

            // copying with a known digest makes the source's tag meaningless
            if copy_from_ref.digest.is_some() {
                copy_from_ref.tag = None;
            }
        }
        Some(value) => {
            let text = value.get();
            let bytes = if text.starts_with('"') {
                // a "raw" base64-string blob; decode it so we're ready to push it
                let encoded: String = serde_json::from_str(text)?;
                STANDARD.decode(encoded).map_err(|e| {
                    Error::Input(format!("{debug_id}: failed to parse base64 data blob: {e}"))
                })?
            } else {
                // otherwise it must be JSON input; if it has any newlines in it, assume it was
                // pretty-printed and make sure it keeps a trailing newline too
                let mut bytes = text.as_bytes().to_vec();
                if bytes.contains(&b'\n') && bytes.last() != Some(&b'\n') {
                    bytes.push(b'\n');
                }
                bytes
            };

            let data_digest = Digest::from_bytes(&bytes);
            if let Some(refs_d) = &refs_digest {
                if *refs_d != data_digest {
                    return Err(Error::Input(format!(
                        "{debug_id}: push-by-digest implied by refs, but data does not match: {refs_d} vs {data_digest}"
                    )));
                }
            } else {
                refs_digest = Some(data_digest);
            }
            data = Some(bytes);
        }
    }

    // any ref that had a digest already matched refs_digest, so blindly stamp them all
    if let Some(digest) = &refs_digest {
        for reference in &mut refs {
            reference.digest = Some(digest.clone());
        }
    }

    // lookup entries are only descent hints now that copy_from has been inferred out of them,
    // so clear their tags and digests; the one exception is the fallback entry of a tag-to-tag
    // copy (no known digest), which still needs its tag to name the source
    let tag_to_tag = copy_from.is_some() && refs_digest.is_none();
    for (key, reference) in &mut lookup {
        reference.digest = None;
        if !(tag_to_tag && key.is_empty()) {
            reference.tag = None;
        }
    }

    let mut media_type = None;
    match op_type {
        DeployType::Manifest => {
            if copy_from.is_none() {
                // any manifest we push must specify mediaType in the manifest itself; the
                // registry push and the child walk both need it, and requiring it in-band
                // avoids the index-vs-manifest interpretation ambiguity
                #[derive(Deserialize)]
                struct MediaTypeHaver {
                    #[serde(rename = "mediaType", default)]
                    media_type: Option<String>,
                }
                let data = data.as_ref().expect("manifest push always has data");
                let haver: MediaTypeHaver = serde_json::from_slice(data).map_err(|e| {
                    Error::Input(format!("{debug_id}: failed to parse manifest data for mediaType: {e}"))
                })?;
                match haver.media_type {
                    Some(found) if !found.is_empty() => media_type = Some(found),
                    _ => {
                        return Err(Error::Input(format!(
                            "{debug_id}: pushing manifest but missing 'mediaType'"
                        )));
                    }
                }
            }
        }
        DeployType::Blob => {
            if let Some(copy_from) = &copy_from {
                if copy_from.digest.is_none() {
                    return Err(Error::Input(format!(
                        "{debug_id}: blobs are always by-digest, and thus need a digest: {copy_from}"
                    )));
                }
            }
        }
    }

    Ok(NormalizedInput {
        op_type,
        refs,
        lookup,
        data,
        copy_from,
        media_type,
    })
}

impl NormalizedInput {
    // run the normalized operation against one destination ref
    pub async fn execute(
        &self,
        clients: &Clients,
        dst: &Reference,
    ) -> Result<Descriptor, registry::Error> {
        let lookup_map: LookupMap = self.lookup.clone();
        match (self.op_type, &self.copy_from) {
            (DeployType::Manifest, None) => {
                let data = Bytes::from(self.data.clone().expect("manifest push carries data"));
                let media_type = self
                    .media_type
                    .as_deref()
                    .expect("normalization extracted a mediaType");
                ensure_manifest(clients, dst, data, media_type, &lookup_map).await
            }
            (DeployType::Manifest, Some(src)) => copy_manifest(clients, src, dst, &lookup_map).await,
            (DeployType::Blob, None) => {
                let data = Bytes::from(self.data.clone().expect("blob push carries data"));
                let digest = dst
                    .digest
                    .clone()
                    .unwrap_or_else(|| Digest::from_bytes(&data));
                let descriptor =
                    Descriptor::new(MEDIA_TYPE_OCTET_STREAM, digest, data.len() as u64);
                let size = data.len() as u64;
                let reader = ObjectReader::from_bytes(descriptor, data);
                ensure_blob(clients, dst, size, reader).await
            }
            (DeployType::Blob, Some(src)) => copy_blob(clients, src, dst).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize_json(raw_json: &str) -> Result<String, Error> {
        let raw: RawInput = serde_json::from_str(raw_json).unwrap();
        let normal = normalize(&raw)?;
        Ok(serde_json::to_string(&normal).unwrap())
    }

    #[test]
    fn test_normalize() {
        for (name, raw, expected) in [
            (
                "manifest JSON",
                r#"{
                    "type": "manifest",
                    "refs": [ "localhost:5000/example:test" ],
                    "data": {"mediaType": "application/vnd.oci.image.index.v1+json"}
                }"#,
                r#"{"type":"manifest","refs":["localhost:5000/example:test@sha256:0ae6b7b9d0bc73ee36c1adef005deb431e94cf009c6a947718b31da3d668032d"],"data":"eyJtZWRpYVR5cGUiOiAiYXBwbGljYXRpb24vdm5kLm9jaS5pbWFnZS5pbmRleC52MStqc29uIn0=","copyFrom":null}"#,
            ),
            (
                "manifest raw",
                r#"{
                    "type": "manifest",
                    "refs": [ "localhost:5000/example" ],
                    "data": "eyJtZWRpYVR5cGUiOiAiYXBwbGljYXRpb24vdm5kLm9jaS5pbWFnZS5pbmRleC52MStqc29uIn0="
                }"#,
                r#"{"type":"manifest","refs":["localhost:5000/example@sha256:0ae6b7b9d0bc73ee36c1adef005deb431e94cf009c6a947718b31da3d668032d"],"data":"eyJtZWRpYVR5cGUiOiAiYXBwbGljYXRpb24vdm5kLm9jaS5pbWFnZS5pbmRleC52MStqc29uIn0=","copyFrom":null}"#,
            ),
            (
                "index with children",
                r#"{
                    "type": "manifest",
                    "refs": [ "localhost:5000/example:test" ],
                    "lookup": { "sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d": "tianon/true" },
                    "data": {"mediaType": "application/vnd.oci.image.index.v1+json","manifests":[{"mediaType":"application/vnd.oci.image.manifest.v1+json","digest":"sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d","size":1165}],"schemaVersion":2}
                }"#,
                r#"{"type":"manifest","refs":["localhost:5000/example:test@sha256:0cb474919526d040392883b84e5babb65a149cc605b89b117781ab94e88a5e86"],"lookup":{"sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d":"tianon/true"},"data":"eyJtZWRpYVR5cGUiOiAiYXBwbGljYXRpb24vdm5kLm9jaS5pbWFnZS5pbmRleC52MStqc29uIiwibWFuaWZlc3RzIjpbeyJtZWRpYVR5cGUiOiJhcHBsaWNhdGlvbi92bmQub2NpLmltYWdlLm1hbmlmZXN0LnYxK2pzb24iLCJkaWdlc3QiOiJzaGEyNTY6OWVmNDJmMWQ2MDJmYjQyM2ZhZDkzNWFhYzFjYWEwY2ZkYmNlMWFkN2VkY2U2NGQwODBhNGViN2IxM2Y3Y2Q5ZCIsInNpemUiOjExNjV9XSwic2NoZW1hVmVyc2lvbiI6Mn0=","copyFrom":null}"#,
            ),
            (
                "image",
                r#"{
                    "type": "manifest",
                    "refs": [ "localhost:5000/example" ],
                    "lookup": { "": "tianon/true" },
                    "data": {"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.v2+json","config":{"mediaType":"application/vnd.docker.container.image.v1+json","size":1471,"digest":"sha256:690912094c0165c489f874c72cee4ba208c28992c0699fa6e10d8cc59f93fec9"},"layers":[{"mediaType":"application/vnd.docker.image.rootfs.diff.tar.gzip","size":129,"digest":"sha256:4c74d744397d4bcbd3079d9c82a87b80d43da376313772978134d1288f20518c"}]}
                }"#,
                r#"{"type":"manifest","refs":["localhost:5000/example@sha256:1c70f9d471b83100c45d5a218d45bbf7e073e11ea5043758a020379a7c78f878"],"lookup":{"":"tianon/true"},"data":"eyJzY2hlbWFWZXJzaW9uIjoyLCJtZWRpYVR5cGUiOiJhcHBsaWNhdGlvbi92bmQuZG9ja2VyLmRpc3RyaWJ1dGlvbi5tYW5pZmVzdC52Mitqc29uIiwiY29uZmlnIjp7Im1lZGlhVHlwZSI6ImFwcGxpY2F0aW9uL3ZuZC5kb2NrZXIuY29udGFpbmVyLmltYWdlLnYxK2pzb24iLCJzaXplIjoxNDcxLCJkaWdlc3QiOiJzaGEyNTY6NjkwOTEyMDk0YzAxNjVjNDg5Zjg3NGM3MmNlZTRiYTIwOGMyODk5MmMwNjk5ZmE2ZTEwZDhjYzU5ZjkzZmVjOSJ9LCJsYXllcnMiOlt7Im1lZGlhVHlwZSI6ImFwcGxpY2F0aW9uL3ZuZC5kb2NrZXIuaW1hZ2Uucm9vdGZzLmRpZmYudGFyLmd6aXAiLCJzaXplIjoxMjksImRpZ2VzdCI6InNoYTI1Njo0Yzc0ZDc0NDM5N2Q0YmNiZDMwNzlkOWM4MmE4N2I4MGQ0M2RhMzc2MzEzNzcyOTc4MTM0ZDEyODhmMjA1MThjIn1dfQ==","copyFrom":null}"#,
            ),
            (
                "blob raw",
                r#"{
                    "type": "blob",
                    "refs": [ "localhost:5000/example@sha256:1a51828d59323e0e02522c45652b6a7a44a032b464b06d574f067d2358b0e9f1" ],
                    "data": "YnVmZnkgdGhlIHZhbXBpcmUgc2xheWVyCg=="
                }"#,
                r#"{"type":"blob","refs":["localhost:5000/example@sha256:1a51828d59323e0e02522c45652b6a7a44a032b464b06d574f067d2358b0e9f1"],"data":"YnVmZnkgdGhlIHZhbXBpcmUgc2xheWVyCg==","copyFrom":null}"#,
            ),
            (
                "blob json",
                "{\n\t\"type\": \"blob\",\n\t\"refs\": [ \"localhost:5000/example@sha256:d914176fd50bd7f565700006a31aa97b79d3ad17cee20c8e5ff2061d5cb74817\" ],\n\t\"data\": {\n}\n}",
                r#"{"type":"blob","refs":["localhost:5000/example@sha256:d914176fd50bd7f565700006a31aa97b79d3ad17cee20c8e5ff2061d5cb74817"],"data":"ewp9Cg==","copyFrom":null}"#,
            ),
            (
                "copy manifest (single lookup)",
                r#"{
                    "type": "manifest",
                    "refs": [ "localhost:5000/example" ],
                    "lookup": { "sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d": "tianon/true" }
                }"#,
                r#"{"type":"manifest","refs":["localhost:5000/example@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d"],"lookup":{"":"tianon/true","sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d":"tianon/true"},"data":null,"copyFrom":"tianon/true@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d"}"#,
            ),
            (
                "copy manifest (fallback lookup)",
                r#"{
                    "type": "manifest",
                    "refs": [ "localhost:5000/example" ],
                    "lookup": { "": "tianon/true@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d" }
                }"#,
                r#"{"type":"manifest","refs":["localhost:5000/example@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d"],"lookup":{"":"tianon/true"},"data":null,"copyFrom":"tianon/true@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d"}"#,
            ),
            (
                "copy manifest (ref digest+fallback)",
                r#"{
                    "type": "manifest",
                    "refs": [ "localhost:5000/example@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d" ],
                    "lookup": { "": "tianon/true" }
                }"#,
                r#"{"type":"manifest","refs":["localhost:5000/example@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d"],"lookup":{"":"tianon/true"},"data":null,"copyFrom":"tianon/true@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d"}"#,
            ),
            (
                // the fallback entry keeps its tag for a tag-to-tag copy (that is what still
                // names the source, and it keeps normalization idempotent)
                "copy manifest (tag)",
                r#"{
                    "type": "manifest",
                    "refs": [ "localhost:5000/example:test" ],
                    "lookup": { "": "tianon/true:oci" }
                }"#,
                r#"{"type":"manifest","refs":["localhost:5000/example:test"],"lookup":{"":"tianon/true:oci"},"data":null,"copyFrom":"tianon/true:oci"}"#,
            ),
            (
                "copy blob (single lookup)",
                r#"{
                    "type": "blob",
                    "refs": [ "localhost:5000/example" ],
                    "lookup": { "sha256:25be82253336f0b8c4347bc4ecbbcdc85d0e0f118ccf8dc2e119c0a47a0a486e": "tianon/true" }
                }"#,
                r#"{"type":"blob","refs":["localhost:5000/example@sha256:25be82253336f0b8c4347bc4ecbbcdc85d0e0f118ccf8dc2e119c0a47a0a486e"],"lookup":{"":"tianon/true","sha256:25be82253336f0b8c4347bc4ecbbcdc85d0e0f118ccf8dc2e119c0a47a0a486e":"tianon/true"},"data":null,"copyFrom":"tianon/true@sha256:25be82253336f0b8c4347bc4ecbbcdc85d0e0f118ccf8dc2e119c0a47a0a486e"}"#,
            ),
            (
                "copy blob (fallback lookup)",
                r#"{
                    "type": "blob",
                    "refs": [ "localhost:5000/example" ],
                    "lookup": { "": "tianon/true@sha256:25be82253336f0b8c4347bc4ecbbcdc85d0e0f118ccf8dc2e119c0a47a0a486e" }
                }"#,
                r#"{"type":"blob","refs":["localhost:5000/example@sha256:25be82253336f0b8c4347bc4ecbbcdc85d0e0f118ccf8dc2e119c0a47a0a486e"],"lookup":{"":"tianon/true"},"data":null,"copyFrom":"tianon/true@sha256:25be82253336f0b8c4347bc4ecbbcdc85d0e0f118ccf8dc2e119c0a47a0a486e"}"#,
            ),
            (
                "copy blob (ref digest+fallback)",
                r#"{
                    "type": "blob",
                    "refs": [ "localhost:5000/example@sha256:25be82253336f0b8c4347bc4ecbbcdc85d0e0f118ccf8dc2e119c0a47a0a486e" ],
                    "lookup": { "": "tianon/true" }
                }"#,
                r#"{"type":"blob","refs":["localhost:5000/example@sha256:25be82253336f0b8c4347bc4ecbbcdc85d0e0f118ccf8dc2e119c0a47a0a486e"],"lookup":{"":"tianon/true"},"data":null,"copyFrom":"tianon/true@sha256:25be82253336f0b8c4347bc4ecbbcdc85d0e0f118ccf8dc2e119c0a47a0a486e"}"#,
            ),
            (
                "multiple refs",
                r#"{
                    "type": "manifest",
                    "refs": [
                        "localhost:5000/foo@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d",
                        "localhost:5000/bar",
                        "localhost:5000/baz@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d"
                    ],
                    "lookup": { "": "tianon/true" }
                }"#,
                r#"{"type":"manifest","refs":["localhost:5000/foo@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d","localhost:5000/bar@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d","localhost:5000/baz@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d"],"lookup":{"":"tianon/true"},"data":null,"copyFrom":"tianon/true@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d"}"#,
            ),
            (
                "multiple refs + multiple lookup (copy)",
                r#"{
                    "type": "manifest",
                    "refs": [
                        "localhost:5000/foo@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d",
                        "localhost:5000/bar",
                        "localhost:5000/baz@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d"
                    ],
                    "lookup": {
                        "sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d": "tianon/true",
                        "sha256:25be82253336f0b8c4347bc4ecbbcdc85d0e0f118ccf8dc2e119c0a47a0a486e": "tianon/true"
                    }
                }"#,
                r#"{"type":"manifest","refs":["localhost:5000/foo@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d","localhost:5000/bar@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d","localhost:5000/baz@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d"],"lookup":{"":"tianon/true","sha256:25be82253336f0b8c4347bc4ecbbcdc85d0e0f118ccf8dc2e119c0a47a0a486e":"tianon/true","sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d":"tianon/true"},"data":null,"copyFrom":"tianon/true@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d"}"#,
            ),
        ] {
            let normal = normalize_json(raw).unwrap_or_else(|e| panic!("{name}: {e}"));
            assert_eq!(normal, expected, "{name}");

            // normalization is idempotent, and the normalized form is valid raw input
            let again = normalize_json(&normal).unwrap_or_else(|e| panic!("{name} (again): {e}"));
            assert_eq!(again, expected, "{name} (idempotence)");
        }
    }

    #[test]
    fn test_normalize_rejects() {
        for (name, raw) in [
            ("missing type", r#"{"refs":["localhost:5000/example"]}"#),
            ("unknown type", r#"{"type":"nonsense","refs":["localhost:5000/example"]}"#),
            ("missing refs", r#"{"type":"manifest"}"#),
            ("zero refs", r#"{"type":"manifest","refs":[]}"#),
            (
                "refs digest mismatch",
                r#"{"type":"blob","refs":[
                    "localhost:5000/a@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d",
                    "localhost:5000/b@sha256:25be82253336f0b8c4347bc4ecbbcdc85d0e0f118ccf8dc2e119c0a47a0a486e"
                ]}"#,
            ),
            (
                "blob with tag",
                r#"{"type":"blob","refs":["localhost:5000/example:tagged"],"data":"aGk="}"#,
            ),
            (
                "bad lookup key",
                r#"{"type":"manifest","refs":["localhost:5000/example:t"],"lookup":{"sha256:nope":"tianon/true"},"data":{"mediaType":"application/vnd.oci.image.index.v1+json"}}"#,
            ),
            (
                "lookup key and ref digest disagree",
                r#"{"type":"manifest","refs":["localhost:5000/example:t"],"lookup":{"sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d":"tianon/true@sha256:25be82253336f0b8c4347bc4ecbbcdc85d0e0f118ccf8dc2e119c0a47a0a486e"},"data":{"mediaType":"application/vnd.oci.image.index.v1+json"}}"#,
            ),
            (
                "copy without usable lookup",
                r#"{"type":"manifest","refs":["localhost:5000/example:t"],"lookup":{"":"tianon/true"}}"#,
            ),
            (
                "copy-by-digest mismatch",
                r#"{"type":"manifest","refs":["localhost:5000/example@sha256:25be82253336f0b8c4347bc4ecbbcdc85d0e0f118ccf8dc2e119c0a47a0a486e"],"lookup":{"sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d":"tianon/true"}}"#,
            ),
            (
                "data digest mismatch",
                r#"{"type":"blob","refs":["localhost:5000/example@sha256:9ef42f1d602fb423fad935aac1caa0cfdbce1ad7edce64d080a4eb7b13f7cd9d"],"data":"aGk="}"#,
            ),
            (
                "manifest push without mediaType",
                r#"{"type":"manifest","refs":["localhost:5000/example:t"],"data":{"schemaVersion":2}}"#,
            ),
        ] {
            let raw: RawInput = serde_json::from_str(raw).unwrap();
            assert!(normalize(&raw).is_err(), "{name}");
        }
    }
}
