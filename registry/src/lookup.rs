use crate::client::{Clients, Error, ObjectReader};
use crate::reference::Reference;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LookupType {
    #[default]
    Manifest,
    Blob,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LookupOptions {
    pub lookup_type: LookupType,
    // do a HEAD instead of a GET; still returns a reader, just a zero-length one that only
    // carries a valid descriptor
    pub head: bool,
}

fn is_not_found(error: &Error) -> bool {
    match error.root() {
        Error::ManifestUnknown | Error::BlobUnknown | Error::NameUnknown => true,
        // 401 often means "repository not found" (public/private mixing on Hub: auth already
        // happened below us, so a lingering 401 might as well be a 404; 403 likewise)
        Error::Status { status, .. } => matches!(status, 404 | 401 | 403),
        _ => false,
    }
}

// one call that maps (reference, {manifest|blob}, {GET|HEAD}) onto the right client operation
// and folds all the not-found shapes into None so callers can just match on it
pub async fn lookup(
    clients: &Clients,
    reference: &Reference,
    options: LookupOptions,
) -> Result<Option<ObjectReader>, Error> {
    let client = clients.for_ref(reference)?;
    let repo = &reference.repository;

    let result = match options.lookup_type {
        LookupType::Manifest => match &reference.digest {
            Some(digest) => {
                if options.head {
                    client
                        .resolve_manifest(repo, digest)
                        .await
                        .map(ObjectReader::empty)
                } else {
                    client.get_manifest(repo, digest).await
                }
            }
            None => {
                let tag = reference.tag_or_latest();
                if options.head {
                    client.resolve_tag(repo, tag).await.map(ObjectReader::empty)
                } else {
                    client.get_tag(repo, tag).await
                }
            }
        },
        LookupType::Blob => {
            let Some(digest) = &reference.digest else {
                return Err(Error::Validation(format!(
                    "{reference}: blob lookup requires a digest"
                )));
            };
            if options.head {
                client
                    .resolve_blob(repo, digest)
                    .await
                    .map(ObjectReader::empty)
            } else {
                client.get_blob(repo, digest).await
            }
        }
    };

    match result {
        Ok(reader) => Ok(Some(reader)),
        Err(error) if is_not_found(&error) => Ok(None),
        Err(error) => Err(error.context(reference)),
    }
}
