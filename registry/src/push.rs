use std::collections::BTreeMap;

use bytes::Bytes;
use futures::future::BoxFuture;
use log::debug;

use crate::client::{Clients, Contextual, Error, ObjectReader};
use crate::digest::Digest;
use crate::lookup::{LookupOptions, LookupType, lookup};
use crate::reference::Reference;
use crate::spec::{
    Descriptor, MEDIA_TYPE_OCTET_STREAM, ManifestChildren, is_manifest_media_type,
};

// where to find child objects if the destination turns out to be missing them; keyed by digest
// string, with "" as the fallback entry for any child that has no entry of its own
pub type LookupMap = BTreeMap<String, Reference>;

// blobs at or below this size are pushed blind; anything bigger gets a HEAD probe first so we
// can skip the expensive upload when the destination already has it
const BLOB_PROBE_THRESHOLD: u64 = 65535;

fn needs_children(error: &Error) -> bool {
    match error.root() {
        // this probably means we need to push some child manifests and/or mount missing blobs
        // (and then retry the manifest push)
        Error::ManifestBlobUnknown | Error::BlobUnknown => true,
        Error::Status { status, .. } => (400..500).contains(status),
        _ => false,
    }
}

// make sure the given manifest bytes exist at dst (by tag when it has one, by digest
// otherwise). a failed push gets one round of child copying (per the lookup table) and a
// single retry; the registry-returned digest must match the locally computed one
pub async fn ensure_manifest(
    clients: &Clients,
    dst: &Reference,
    data: Bytes,
    media_type: &str,
    lookup_map: &LookupMap,
) -> Result<Descriptor, Error> {
    ensure_manifest_inner(clients, dst.clone(), data, media_type.to_string(), lookup_map.clone())
        .await
}

// recursion via a boxed future since child manifests take this same path
fn ensure_manifest_inner<'a>(
    clients: &'a Clients,
    dst: Reference,
    data: Bytes,
    media_type: String,
    lookup_map: LookupMap,
) -> BoxFuture<'a, Result<Descriptor, Error>> {
    Box::pin(async move {
        let descriptor = Descriptor::new(
            media_type.clone(),
            Digest::from_bytes(&data),
            data.len() as u64,
        );

        if let Some(digest) = &dst.digest {
            if *digest != descriptor.digest {
                return Err(Error::DigestMismatch {
                    expected: digest.clone(),
                    actual: descriptor.digest,
                }
                .context(&dst));
            }
        } else if dst.tag.is_none() {
            return Err(Error::Validation(format!(
                "{dst}: missing tag (and we want to be explicit)"
            )));
        }

        if !is_manifest_media_type(&media_type) {
            return Err(Error::UnsupportedMediaType(media_type).context(&dst));
        }

        // probe the destination first (by tag when we have one, else by digest); if it already
        // matches there is nothing to do
        let probe = Reference {
            digest: if dst.tag.is_some() {
                None
            } else {
                Some(descriptor.digest.clone())
            },
            ..dst.clone()
        };
        let head = LookupOptions {
            lookup_type: LookupType::Manifest,
            head: true,
        };
        if let Some(existing) = lookup(clients, &probe, head).await? {
            if existing.descriptor.digest == descriptor.digest {
                debug!("{dst}: already present, skipping push");
                return Ok(existing.descriptor);
            }
        }

        let client = clients.for_ref(&dst)?;
        let push_ref = match &dst.tag {
            Some(tag) => tag.clone(),
            None => descriptor.digest.to_string(),
        };

        let pushed = match client
            .push_manifest(&dst.repository, &push_ref, &data, &media_type)
            .await
        {
            Ok(pushed) => pushed,
            Err(error) if needs_children(&error) => {
                push_children(clients, &dst, &data, &lookup_map).await?;
                client
                    .push_manifest(&dst.repository, &push_ref, &data, &media_type)
                    .await
                    .context(&dst)?
            }
            Err(error) => return Err(error.context(&dst)),
        };

        if pushed.digest != descriptor.digest {
            return Err(Error::Validation(format!(
                "{dst}: pushed digest from registry ({}) does not match expected digest ({})",
                pushed.digest, descriptor.digest
            )));
        }
        Ok(descriptor)
    })
}

// copy every potential child of the manifest into dst's repository: child manifests get
// recursively ensured, everything else is treated as a blob and copied (cross-repo mount when
// the source lives on the same host, streaming otherwise)
async fn push_children(
    clients: &Clients,
    dst: &Reference,
    manifest: &Bytes,
    lookup_map: &LookupMap,
) -> Result<(), Error> {
    let children = ManifestChildren::parse(manifest).context(dst)?;
    for child in children.into_children() {
        if child.has_urls() {
            // foreign layer; the registry is not expected to hold its bytes
            debug!("{dst}: skipping foreign layer {}", child.digest);
            continue;
        }

        let child_target = Reference {
            host: dst.host.clone(),
            repository: dst.repository.clone(),
            tag: None,
            digest: Some(child.digest.clone()),
        };

        let mut child_src = lookup_map
            .get(child.digest.as_str())
            .or_else(|| lookup_map.get(""))
            .ok_or_else(|| {
                Error::Validation(format!(
                    "{dst}: missing source reference for missing child: {}",
                    child.digest
                ))
            })?
            .clone();
        child_src.tag = None;
        child_src.digest = Some(child.digest.clone());

        if is_manifest_media_type(&child.media_type) {
            let src_client = clients.for_ref(&child_src)?;
            let reader = src_client
                .get_manifest(&child_src.repository, &child.digest)
                .await
                .context(&child_src)?;
            let child_data = reader.bytes().await.context(&child_src)?;

            // children of this child look near it by default
            let mut child_lookup = lookup_map.clone();
            let mut fallback = child_src.clone();
            fallback.digest = None;
            child_lookup.insert(String::new(), fallback);

            ensure_manifest_inner(
                clients,
                child_target,
                child_data,
                child.media_type.clone(),
                child_lookup,
            )
            .await?;
        } else {
            copy_blob(clients, &child_src, &child_target).await?;
        }
    }
    Ok(())
}

// fetch the manifest at src and ensure it (bytes and media type intact) at dst
pub async fn copy_manifest(
    clients: &Clients,
    src: &Reference,
    dst: &Reference,
    lookup_map: &LookupMap,
) -> Result<Descriptor, Error> {
    let reader = lookup(clients, src, LookupOptions::default())
        .await?
        .ok_or_else(|| Error::ManifestUnknown.context(src))?;
    let descriptor = reader.descriptor.clone();
    let data = reader.bytes().await.context(src)?;

    let mut lookup_map = lookup_map.clone();
    lookup_map.entry(String::new()).or_insert_with(|| {
        let mut fallback = src.clone();
        fallback.tag = None;
        fallback.digest = None;
        fallback
    });

    ensure_manifest(clients, dst, data, &descriptor.media_type, &lookup_map).await
}

// make sure the blob bytes exist at dst; big blobs get a HEAD probe first
pub async fn ensure_blob(
    clients: &Clients,
    dst: &Reference,
    size: u64,
    body: ObjectReader,
) -> Result<Descriptor, Error> {
    let Some(digest) = dst.digest.clone() else {
        return Err(Error::Validation(format!(
            "{dst}: blobs are always by-digest, and thus need a digest"
        )));
    };
    if dst.tag.is_some() {
        return Err(Error::Validation(format!("{dst}: cannot push blobs to a tag")));
    }

    if size > BLOB_PROBE_THRESHOLD {
        let head = LookupOptions {
            lookup_type: LookupType::Blob,
            head: true,
        };
        if let Some(existing) = lookup(clients, dst, head).await? {
            if existing.descriptor.digest == digest {
                debug!("{dst}: blob already present, skipping upload");
                return Ok(existing.descriptor);
            }
        }
    }

    let client = clients.for_ref(dst)?;
    let descriptor = Descriptor::new(MEDIA_TYPE_OCTET_STREAM, digest.clone(), size);
    let pushed = client
        .push_blob(&dst.repository, &descriptor, body)
        .await
        .context(dst)?;
    if pushed.digest != digest {
        return Err(Error::Validation(format!(
            "{dst}: pushed digest from registry ({}) does not match expected digest ({digest})",
            pushed.digest
        )));
    }
    Ok(pushed)
}

// copy a blob between repositories: a cross-repo mount when both live on the same host, a
// streamed get+push otherwise (the protocol has no cross-registry mount)
pub async fn copy_blob(
    clients: &Clients,
    src: &Reference,
    dst: &Reference,
) -> Result<Descriptor, Error> {
    let Some(digest) = src.digest.clone() else {
        return Err(Error::Validation(format!(
            "{src}: blobs are always by-digest, and thus need a digest"
        )));
    };
    if src.tag.is_some() || dst.tag.is_some() {
        return Err(Error::Validation(format!(
            "{dst}: cannot copy blobs via tags ({src})"
        )));
    }
    if let Some(dst_digest) = &dst.digest {
        if *dst_digest != digest {
            return Err(Error::DigestMismatch {
                expected: dst_digest.clone(),
                actual: digest,
            }
            .context(dst));
        }
    }

    if src.host == dst.host {
        let client = clients.for_ref(dst)?;
        let mounted = client
            .mount_blob(&src.repository, &dst.repository, &digest)
            .await
            .map_err(|e| e.context(format!("{dst}: MountBlob({src})")))?;
        if mounted.digest != digest {
            return Err(Error::Validation(format!(
                "{dst}: mounted digest from registry ({}) does not match expected digest ({digest})",
                mounted.digest
            )));
        }
        return Ok(mounted);
    }

    let options = LookupOptions {
        lookup_type: LookupType::Blob,
        head: false,
    };
    let reader = lookup(clients, src, options)
        .await?
        .ok_or_else(|| Error::BlobUnknown.context(src))?;
    let size = reader.descriptor.size;
    let target = dst.with_digest(digest);
    ensure_blob(clients, &target, size, reader).await
}
