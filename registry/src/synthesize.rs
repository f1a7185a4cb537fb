use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;

use crate::arches;
use crate::client::{Clients, Contextual, Error, read_json};
use crate::digest::Digest;
use crate::lookup::{LookupOptions, LookupType, lookup};
use crate::reference::Reference;
use crate::spec::{
    ANNOTATION_ARCH, ANNOTATION_REF_NAME, ANNOTATION_REFERENCE_DIGEST, ANNOTATION_REFERENCE_TYPE,
    ANNOTATION_REFERENCE_TYPE_ATTESTATION, Descriptor, Index, MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX, Manifest, Platform,
    is_config_media_type, is_image_manifest_media_type, is_index_media_type,
};

// add (or overwrite) the upstream-reference annotation: the canonical text of the reference
// with its digest swapped for the given one
fn set_ref_annotation(
    annotations: &mut Option<BTreeMap<String, String>>,
    reference: &Reference,
    digest: &Digest,
) {
    let upstream = reference.with_digest(digest.clone());
    annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(ANNOTATION_REF_NAME.to_string(), upstream.to_string());
}

// returns a synthesized index for the given reference: every entry gets a usable platform
// (pulled up out of the image config if the index didn't carry one), an architecture
// annotation when the platform is one we build for, and an upstream-reference annotation
// saying where the object can be fetched. attestation entries inherit the architecture of
// their subject and are dropped when the subject is gone. None when the reference itself
// does not exist
pub async fn synthesize_index(
    clients: &Clients,
    reference: &Reference,
) -> Result<Option<Index>, Error> {
    let Some(reader) = lookup(clients, reference, LookupOptions::default()).await? else {
        return Ok(None);
    };
    let descriptor = reader.descriptor.clone();

    let mut index = if is_image_manifest_media_type(&descriptor.media_type) {
        // a bare image manifest gets wrapped as a single-entry index
        let data = reader.bytes().await?;
        let mut entry = descriptor.clone();
        normalize_manifest_platform(clients, reference, &mut entry, Some(data))
            .await
            .context(reference)?;
        Index {
            schema_version: 0,
            media_type: None,
            manifests: vec![entry],
            annotations: None,
        }
    } else if is_index_media_type(&descriptor.media_type) {
        read_json::<Index>(reader).await.context(reference)?
    } else {
        return Err(
            Error::UnsupportedMediaType(descriptor.media_type.clone()).context(reference)
        );
    };

    index.schema_version = match index.schema_version {
        0 => 2,
        2 => 2,
        version => return Err(Error::UnsupportedSchemaVersion(version).context(reference)),
    };

    match index.media_type.as_deref() {
        None | Some("") => {
            // if the first item in our list is a Docker media type, our list should be too
            let media_type = match index.manifests.first() {
                Some(first) if first.media_type == MEDIA_TYPE_DOCKER_MANIFEST => {
                    MEDIA_TYPE_DOCKER_MANIFEST_LIST
                }
                _ => MEDIA_TYPE_OCI_INDEX,
            };
            index.media_type = Some(media_type.to_string());
        }
        Some(media_type) if is_index_media_type(media_type) => {}
        Some(media_type) => {
            return Err(Error::UnsupportedMediaType(media_type.to_string()).context(reference));
        }
    }

    set_ref_annotation(&mut index.annotations, reference, &descriptor.digest);

    // digest => position in kept entries; doubles as the de-dupe set and the subject lookup
    // for attestations
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<Descriptor> = Vec::with_capacity(index.manifests.len());
    for mut entry in std::mem::take(&mut index.manifests) {
        if seen.contains_key(entry.digest.as_str()) {
            // the image spec says "first match SHOULD win", so dropping later duplicates is fine
            continue;
        }

        let entry_digest = entry.digest.clone();
        set_ref_annotation(&mut entry.annotations, reference, &entry_digest);

        let upstream = entry
            .annotation(ANNOTATION_REF_NAME)
            .unwrap_or_default()
            .to_string();
        normalize_manifest_platform(clients, reference, &mut entry, None)
            .await
            .context(upstream)?;

        // never trust a remote-provided arch annotation, it's cheap to compute fresh
        entry.remove_annotation(ANNOTATION_ARCH);
        if entry.annotation(ANNOTATION_REFERENCE_TYPE)
            == Some(ANNOTATION_REFERENCE_TYPE_ATTESTATION)
        {
            let subject_arch = entry
                .annotation(ANNOTATION_REFERENCE_DIGEST)
                .and_then(|digest| seen.get(digest))
                .and_then(|&position| kept[position].annotation(ANNOTATION_ARCH))
                .map(str::to_string);
            match subject_arch {
                Some(arch) => entry.set_annotation(ANNOTATION_ARCH, arch),
                // the subject is missing from the index, so drop the attestation too
                None => continue,
            }
        } else if let Some(platform) = &entry.platform {
            if let Some(arch) = arches::arch_for_platform(platform) {
                entry.set_annotation(ANNOTATION_ARCH, arch);
            }
        }

        seen.insert(entry.digest.as_str().to_string(), kept.len());
        kept.push(entry);
    }
    index.manifests = kept;

    Ok(Some(index))
}

// make sure the descriptor has a valid platform if at all possible, reaching down into the
// manifest's config blob when the index entry didn't carry one
async fn normalize_manifest_platform(
    clients: &Clients,
    reference: &Reference,
    entry: &mut Descriptor,
    body: Option<Bytes>,
) -> Result<(), Error> {
    let unusable = entry
        .platform
        .as_ref()
        .is_none_or(|platform| platform.os.is_empty() || platform.architecture.is_empty());
    if unusable {
        entry.platform = None;

        if is_image_manifest_media_type(&entry.media_type) {
            let manifest: Manifest = match body {
                Some(data) => serde_json::from_slice(&data)?,
                None => {
                    let manifest_ref = Reference {
                        host: reference.host.clone(),
                        repository: reference.repository.clone(),
                        tag: None,
                        digest: Some(entry.digest.clone()),
                    };
                    let reader = lookup(clients, &manifest_ref, LookupOptions::default())
                        .await?
                        .ok_or_else(|| Error::ManifestUnknown.context(&manifest_ref))?;
                    read_json(reader).await.context(&manifest_ref)?
                }
            };

            if let Some(config) = &manifest.config {
                if is_config_media_type(&config.media_type) {
                    let blob_ref = Reference {
                        host: reference.host.clone(),
                        repository: reference.repository.clone(),
                        tag: None,
                        digest: Some(config.digest.clone()),
                    };
                    let options = LookupOptions {
                        lookup_type: LookupType::Blob,
                        head: false,
                    };
                    let reader = lookup(clients, &blob_ref, options)
                        .await?
                        .ok_or_else(|| Error::BlobUnknown.context(&blob_ref))?;
                    let config: crate::spec::ImageConfig =
                        read_json(reader).await.context(&blob_ref)?;
                    if !config.os.is_empty() && !config.architecture.is_empty() {
                        entry.platform = Some(Platform {
                            architecture: config.architecture,
                            os: config.os,
                            os_version: config.os_version,
                            os_features: None,
                            variant: config.variant,
                        });
                    }
                }
            }
        }
    }

    if let Some(platform) = entry.platform.take() {
        entry.platform = Some(arches::normalize(platform));
    }
    Ok(())
}
