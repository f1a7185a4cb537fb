use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use log::{trace, warn};
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use sha2::{Digest as _, Sha256, Sha512};

use crate::auth::{AuthStore, Credential, ScopeKind, TokenAuth, basic_header, parse_bearer_challenge};
use crate::cache::CachingRegistry;
use crate::digest::{Digest, DigestParseError};
use crate::limit::{HostLimiter, RateLimitedRetry, docker_hub_limiter};
use crate::reference::{
    DOCKER_HUB_CANONICAL, DOCKER_HUB_CONNECT, RefParseError, Reference,
};
use crate::spec::{Descriptor, MEDIA_TYPE_OCTET_STREAM};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // typed distribution-spec error codes; the lookup facade folds these to None
    #[error("manifest unknown")]
    ManifestUnknown,
    #[error("blob unknown")]
    BlobUnknown,
    #[error("name unknown")]
    NameUnknown,
    #[error("manifest blob unknown")]
    ManifestBlobUnknown,
    #[error("unexpected status {status}: {body:?}")]
    Status { status: u16, body: String },
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },
    #[error("size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("missing or unparseable digest header")]
    BadDigestHeader,
    #[error("upload session missing usable Location")]
    BadUploadLocation,
    #[error("unsupported media type {0:?}")]
    UnsupportedMediaType(String),
    #[error("unsupported index schemaVersion {0}")]
    UnsupportedSchemaVersion(u32),
    #[error("unknown host {0:?}")]
    UnknownHost(String),
    #[error("auth token: {0}")]
    Token(String),
    #[error("config: {0}")]
    Config(String),
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    BadDigest(#[from] DigestParseError),
    #[error(transparent)]
    BadRef(#[from] RefParseError),
    #[error(transparent)]
    Http(#[from] reqwest_middleware::Error),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn context(self, context: impl fmt::Display) -> Error {
        Error::Context {
            context: context.to_string(),
            source: Box::new(self),
        }
    }

    // unwrap any context layers so callers can match on what actually went wrong
    pub fn root(&self) -> &Error {
        let mut error = self;
        while let Error::Context { source, .. } = error {
            error = source;
        }
        error
    }

    pub fn status(&self) -> Option<u16> {
        match self.root() {
            Error::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

// .context(...) on results, in the spirit of wrapping errors with the responsible reference
pub trait Contextual<T> {
    fn context(self, context: impl fmt::Display) -> Result<T, Error>;
}

impl<T, E: Into<Error>> Contextual<T> for Result<T, E> {
    fn context(self, context: impl fmt::Display) -> Result<T, Error> {
        self.map_err(|e| e.into().context(context))
    }
}

enum ObjectBody {
    Empty,
    Bytes(Bytes),
    Stream(futures::stream::BoxStream<'static, reqwest::Result<Bytes>>),
}

// an object plus its descriptor; small objects are held as bytes, blobs stream
pub struct ObjectReader {
    pub descriptor: Descriptor,
    body: ObjectBody,
}

impl ObjectReader {
    pub fn from_bytes(descriptor: Descriptor, data: Bytes) -> Self {
        ObjectReader {
            descriptor,
            body: ObjectBody::Bytes(data),
        }
    }

    // a zero-length reader that only carries a descriptor (HEAD results)
    pub fn empty(descriptor: Descriptor) -> Self {
        ObjectReader {
            descriptor,
            body: ObjectBody::Empty,
        }
    }

    pub fn from_response(descriptor: Descriptor, response: reqwest::Response) -> Self {
        ObjectReader {
            descriptor,
            body: ObjectBody::Stream(response.bytes_stream().boxed()),
        }
    }

    pub async fn bytes(self) -> Result<Bytes, Error> {
        match self.body {
            ObjectBody::Empty => Ok(Bytes::new()),
            ObjectBody::Bytes(data) => Ok(data),
            ObjectBody::Stream(mut stream) => {
                let mut data = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    data.extend_from_slice(&chunk?);
                }
                Ok(data.freeze())
            }
        }
    }

    pub fn into_request_body(self) -> reqwest::Body {
        match self.body {
            ObjectBody::Empty => reqwest::Body::from(Bytes::new()),
            ObjectBody::Bytes(data) => reqwest::Body::from(data),
            ObjectBody::Stream(stream) => reqwest::Body::wrap_stream(stream),
        }
    }
}

pub fn data_matches_digest(digest: &Digest, data: &[u8]) -> bool {
    match digest.algorithm() {
        "sha256" => hex::encode(Sha256::digest(data)) == digest.encoded(),
        "sha512" => hex::encode(Sha512::digest(data)) == digest.encoded(),
        _ => false,
    }
}

// read a JSON object out of a reader while validating the descriptor's size and digest
pub async fn read_json<T: DeserializeOwned>(reader: ObjectReader) -> Result<T, Error> {
    let descriptor = reader.descriptor.clone();
    let data = reader.bytes().await?;
    if descriptor.size != data.len() as u64 {
        return Err(Error::SizeMismatch {
            expected: descriptor.size,
            actual: data.len() as u64,
        });
    }
    if !data_matches_digest(&descriptor.digest, &data) {
        return Err(Error::DigestMismatch {
            expected: descriptor.digest,
            actual: Digest::from_bytes(&data),
        });
    }
    Ok(serde_json::from_slice(&data)?)
}

// the registry operations the pipeline needs; implemented over HTTP, by the in-memory
// registry, and by the cache/proxy wrappers
#[async_trait]
pub trait Registry: Send + Sync {
    async fn get_manifest(&self, repo: &str, digest: &Digest) -> Result<ObjectReader, Error>;
    async fn get_tag(&self, repo: &str, tag: &str) -> Result<ObjectReader, Error>;
    async fn get_blob(&self, repo: &str, digest: &Digest) -> Result<ObjectReader, Error>;
    async fn resolve_manifest(&self, repo: &str, digest: &Digest) -> Result<Descriptor, Error>;
    async fn resolve_tag(&self, repo: &str, tag: &str) -> Result<Descriptor, Error>;
    async fn resolve_blob(&self, repo: &str, digest: &Digest) -> Result<Descriptor, Error>;
    // reference is a tag or a digest string
    async fn push_manifest(
        &self,
        repo: &str,
        reference: &str,
        data: &[u8],
        media_type: &str,
    ) -> Result<Descriptor, Error>;
    async fn push_blob(
        &self,
        repo: &str,
        descriptor: &Descriptor,
        body: ObjectReader,
    ) -> Result<Descriptor, Error>;
    // cross-repo, same registry only (the protocol has no cross-registry mount)
    async fn mount_blob(
        &self,
        from_repo: &str,
        to_repo: &str,
        digest: &Digest,
    ) -> Result<Descriptor, Error>;
    async fn list_tags(&self, repo: &str) -> Result<Vec<String>, Error>;
}

const DOCKER_CONTENT_DIGEST_HEADER: &str = "docker-content-digest";

const ACCEPT_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json, \
    application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json";

pub struct HttpRegistry {
    // canonical host, used for auth lookups and error context
    host: String,
    // scheme://connect-host, no trailing slash
    base: String,
    http: ClientWithMiddleware,
    auth_store: Arc<AuthStore>,
    tokens: TokenAuth,
}

impl HttpRegistry {
    pub fn new(
        host: &str,
        connect_host: &str,
        insecure: bool,
        http: ClientWithMiddleware,
        auth_store: Arc<AuthStore>,
    ) -> Self {
        let scheme = if insecure { "http" } else { "https" };
        HttpRegistry {
            host: host.to_string(),
            base: format!("{scheme}://{connect_host}"),
            http,
            auth_store: auth_store.clone(),
            tokens: TokenAuth::new(auth_store),
        }
    }

    // attach any cached token, send, and on a 401 challenge acquire a token and retry once.
    // requests with non-replayable bodies get no retry; their 401 surfaces to the caller
    async fn send(
        &self,
        request: reqwest_middleware::RequestBuilder,
        repo: &str,
        kind: ScopeKind,
    ) -> Result<reqwest::Response, Error> {
        let retry = request.try_clone();
        let request = match self.tokens.cached_header(&self.host, repo, kind).await {
            Some(header) => request.header(http::header::AUTHORIZATION, header),
            None => request,
        };
        let response = request.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let www = response
            .headers()
            .get(http::header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let (Some(retry), Some(www)) = (retry, www) else {
            return Ok(response);
        };

        if let Some(challenge) = parse_bearer_challenge(&www) {
            let header = self
                .tokens
                .challenge_header(&self.http, &self.host, repo, kind, &challenge)
                .await?;
            return Ok(retry
                .header(http::header::AUTHORIZATION, header)
                .send()
                .await?);
        }
        if www.trim_start().starts_with("Basic") {
            if let Some(Credential::UserPass(user, pass)) = self.auth_store.entry_for(&self.host)
            {
                return Ok(retry
                    .header(http::header::AUTHORIZATION, basic_header(user, pass))
                    .send()
                    .await?);
            }
        }
        warn!("unhandled auth challenge from {}: {:?}", self.host, www);
        Ok(response)
    }

    async fn error_for(&self, response: reqwest::Response) -> Error {
        let status = response.status().as_u16();
        let body = response.bytes().await.unwrap_or_default();

        // distribution-spec error payloads carry machine-readable codes
        #[derive(Deserialize)]
        struct ErrorBody {
            errors: Vec<ErrorEntry>,
        }
        #[derive(Deserialize)]
        struct ErrorEntry {
            code: String,
        }
        if let Ok(parsed) = serde_json::from_slice::<ErrorBody>(&body) {
            for entry in &parsed.errors {
                match entry.code.as_str() {
                    "MANIFEST_UNKNOWN" => return Error::ManifestUnknown,
                    "BLOB_UNKNOWN" => return Error::BlobUnknown,
                    "NAME_UNKNOWN" => return Error::NameUnknown,
                    "MANIFEST_BLOB_UNKNOWN" => return Error::ManifestBlobUnknown,
                    _ => {}
                }
            }
        }

        let mut body = String::from_utf8_lossy(&body).into_owned();
        body.truncate(256);
        Error::Status { status, body }
    }

    fn header_digest(response: &reqwest::Response) -> Result<Option<Digest>, Error> {
        response
            .headers()
            .get(DOCKER_CONTENT_DIGEST_HEADER)
            .map(|value| {
                value
                    .to_str()
                    .ok()
                    .and_then(|s| Digest::parse(s).ok())
                    .ok_or(Error::BadDigestHeader)
            })
            .transpose()
    }

    fn header_media_type(response: &reqwest::Response) -> String {
        response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string()
    }

    fn header_length(response: &reqwest::Response) -> u64 {
        response
            .headers()
            .get(http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    // manifests are small, so we always read them eagerly (which also lets us verify)
    async fn get_manifest_inner(
        &self,
        repo: &str,
        reference: &str,
        known_digest: Option<&Digest>,
    ) -> Result<ObjectReader, Error> {
        let url = format!("{}/v2/{repo}/manifests/{reference}", self.base);
        trace!("GET {url}");
        let request = self
            .http
            .get(&url)
            .header(http::header::ACCEPT, ACCEPT_MANIFEST);
        let response = self.send(request, repo, ScopeKind::Pull).await?;
        if response.status() != StatusCode::OK {
            return Err(self.error_for(response).await);
        }

        let media_type = Self::header_media_type(&response);
        let digest = match known_digest {
            Some(digest) => Some(digest.clone()),
            None => Self::header_digest(&response)?,
        };
        let data = response.bytes().await?;
        // the digest isn't required to be sent for tag requests; compute it ourselves then
        let digest = digest.unwrap_or_else(|| Digest::from_bytes(&data));
        if !data_matches_digest(&digest, &data) {
            return Err(Error::DigestMismatch {
                expected: digest,
                actual: Digest::from_bytes(&data),
            });
        }
        let descriptor = Descriptor::new(media_type, digest, data.len() as u64);
        Ok(ObjectReader::from_bytes(descriptor, data))
    }

    async fn resolve_inner(
        &self,
        repo: &str,
        url: String,
        known_digest: Option<&Digest>,
        default_media_type: &str,
    ) -> Result<Descriptor, Error> {
        trace!("HEAD {url}");
        let request = self
            .http
            .head(&url)
            .header(http::header::ACCEPT, ACCEPT_MANIFEST);
        let response = self.send(request, repo, ScopeKind::Pull).await?;
        if response.status() != StatusCode::OK {
            return Err(self.error_for(response).await);
        }
        let digest = match known_digest {
            Some(digest) => digest.clone(),
            None => Self::header_digest(&response)?.ok_or(Error::BadDigestHeader)?,
        };
        let mut media_type = Self::header_media_type(&response);
        if media_type.is_empty() {
            media_type = default_media_type.to_string();
        }
        Ok(Descriptor::new(
            media_type,
            digest,
            Self::header_length(&response),
        ))
    }

    fn upload_location(&self, response: &reqwest::Response) -> Result<String, Error> {
        let location = response
            .headers()
            .get(http::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(Error::BadUploadLocation)?;
        if location.starts_with("http://") || location.starts_with("https://") {
            Ok(location.to_string())
        } else if location.starts_with('/') {
            Ok(format!("{}{location}", self.base))
        } else {
            Err(Error::BadUploadLocation)
        }
    }

    async fn finish_upload(
        &self,
        repo: &str,
        location: &str,
        descriptor: &Descriptor,
        body: ObjectReader,
    ) -> Result<Descriptor, Error> {
        let sep = if location.contains('?') { '&' } else { '?' };
        let url = format!("{location}{sep}digest={}", descriptor.digest);
        trace!("PUT {url}");
        let mut request = self
            .http
            .put(&url)
            .header(http::header::CONTENT_TYPE, MEDIA_TYPE_OCTET_STREAM)
            .body(body.into_request_body());
        if descriptor.size > 0 {
            request = request.header(http::header::CONTENT_LENGTH, descriptor.size);
        }
        let response = self.send(request, repo, ScopeKind::Push).await?;
        if !response.status().is_success() {
            return Err(self.error_for(response).await);
        }
        Ok(Descriptor::new(
            descriptor.media_type.clone(),
            descriptor.digest.clone(),
            descriptor.size,
        ))
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn get_manifest(&self, repo: &str, digest: &Digest) -> Result<ObjectReader, Error> {
        self.get_manifest_inner(repo, digest.as_str(), Some(digest))
            .await
    }

    async fn get_tag(&self, repo: &str, tag: &str) -> Result<ObjectReader, Error> {
        self.get_manifest_inner(repo, tag, None).await
    }

    async fn get_blob(&self, repo: &str, digest: &Digest) -> Result<ObjectReader, Error> {
        let url = format!("{}/v2/{repo}/blobs/{digest}", self.base);
        trace!("GET {url}");
        let response = self.send(self.http.get(&url), repo, ScopeKind::Pull).await?;
        if response.status() != StatusCode::OK {
            return Err(self.error_for(response).await);
        }
        let mut media_type = Self::header_media_type(&response);
        if media_type.is_empty() {
            media_type = MEDIA_TYPE_OCTET_STREAM.to_string();
        }
        let descriptor = Descriptor::new(media_type, digest.clone(), Self::header_length(&response));
        Ok(ObjectReader::from_response(descriptor, response))
    }

    async fn resolve_manifest(&self, repo: &str, digest: &Digest) -> Result<Descriptor, Error> {
        let url = format!("{}/v2/{repo}/manifests/{digest}", self.base);
        self.resolve_inner(repo, url, Some(digest), "").await
    }

    async fn resolve_tag(&self, repo: &str, tag: &str) -> Result<Descriptor, Error> {
        let url = format!("{}/v2/{repo}/manifests/{tag}", self.base);
        self.resolve_inner(repo, url, None, "").await
    }

    async fn resolve_blob(&self, repo: &str, digest: &Digest) -> Result<Descriptor, Error> {
        let url = format!("{}/v2/{repo}/blobs/{digest}", self.base);
        self.resolve_inner(repo, url, Some(digest), MEDIA_TYPE_OCTET_STREAM)
            .await
    }

    async fn push_manifest(
        &self,
        repo: &str,
        reference: &str,
        data: &[u8],
        media_type: &str,
    ) -> Result<Descriptor, Error> {
        let url = format!("{}/v2/{repo}/manifests/{reference}", self.base);
        trace!("PUT {url}");
        let request = self
            .http
            .put(&url)
            .header(http::header::CONTENT_TYPE, media_type)
            .body(data.to_vec());
        let response = self.send(request, repo, ScopeKind::Push).await?;
        if !response.status().is_success() {
            return Err(self.error_for(response).await);
        }
        let digest = Self::header_digest(&response)?.unwrap_or_else(|| Digest::from_bytes(data));
        Ok(Descriptor::new(media_type, digest, data.len() as u64))
    }

    async fn push_blob(
        &self,
        repo: &str,
        descriptor: &Descriptor,
        body: ObjectReader,
    ) -> Result<Descriptor, Error> {
        let url = format!("{}/v2/{repo}/blobs/uploads/", self.base);
        trace!("POST {url}");
        let response = self.send(self.http.post(&url), repo, ScopeKind::Push).await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(self.error_for(response).await);
        }
        let location = self.upload_location(&response)?;
        self.finish_upload(repo, &location, descriptor, body).await
    }

    async fn mount_blob(
        &self,
        from_repo: &str,
        to_repo: &str,
        digest: &Digest,
    ) -> Result<Descriptor, Error> {
        let url = format!(
            "{}/v2/{to_repo}/blobs/uploads/?mount={digest}&from={from_repo}",
            self.base
        );
        trace!("POST {url}");
        let response = self
            .send(self.http.post(&url), to_repo, ScopeKind::Push)
            .await?;
        match response.status() {
            StatusCode::CREATED => Ok(Descriptor::new(
                MEDIA_TYPE_OCTET_STREAM,
                digest.clone(),
                0,
            )),
            StatusCode::ACCEPTED => {
                // the registry declined the mount and opened a regular upload session instead,
                // so feed it the blob from the source repository
                let location = self.upload_location(&response)?;
                let source = self.get_blob(from_repo, digest).await?;
                let descriptor = source.descriptor.clone();
                self.finish_upload(to_repo, &location, &descriptor, source)
                    .await
            }
            _ => Err(self.error_for(response).await),
        }
    }

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>, Error> {
        #[derive(Deserialize)]
        struct TagList {
            #[serde(default)]
            tags: Vec<String>,
        }
        let url = format!("{}/v2/{repo}/tags/list", self.base);
        trace!("GET {url}");
        let response = self.send(self.http.get(&url), repo, ScopeKind::Pull).await?;
        if response.status() != StatusCode::OK {
            return Err(self.error_for(response).await);
        }
        let list: TagList = response.json().await?;
        Ok(list.tags)
    }
}

// Docker Hub behind an optional read-only public mirror: reads go to the mirror, writes go to
// the authoritative registry. a 404 from the mirror is considered authoritative (it is a pure
// mirror); non-404 mirror failures do not fall back to the origin
pub struct HubProxy {
    reads: Arc<dyn Registry>,
    writes: Arc<dyn Registry>,
}

impl HubProxy {
    pub fn new(reads: Arc<dyn Registry>, writes: Arc<dyn Registry>) -> Self {
        HubProxy { reads, writes }
    }
}

#[async_trait]
impl Registry for HubProxy {
    async fn get_manifest(&self, repo: &str, digest: &Digest) -> Result<ObjectReader, Error> {
        self.reads.get_manifest(repo, digest).await
    }
    async fn get_tag(&self, repo: &str, tag: &str) -> Result<ObjectReader, Error> {
        self.reads.get_tag(repo, tag).await
    }
    async fn get_blob(&self, repo: &str, digest: &Digest) -> Result<ObjectReader, Error> {
        self.reads.get_blob(repo, digest).await
    }
    async fn resolve_manifest(&self, repo: &str, digest: &Digest) -> Result<Descriptor, Error> {
        self.reads.resolve_manifest(repo, digest).await
    }
    async fn resolve_tag(&self, repo: &str, tag: &str) -> Result<Descriptor, Error> {
        self.reads.resolve_tag(repo, tag).await
    }
    async fn resolve_blob(&self, repo: &str, digest: &Digest) -> Result<Descriptor, Error> {
        self.reads.resolve_blob(repo, digest).await
    }
    async fn push_manifest(
        &self,
        repo: &str,
        reference: &str,
        data: &[u8],
        media_type: &str,
    ) -> Result<Descriptor, Error> {
        self.writes.push_manifest(repo, reference, data, media_type).await
    }
    async fn push_blob(
        &self,
        repo: &str,
        descriptor: &Descriptor,
        body: ObjectReader,
    ) -> Result<Descriptor, Error> {
        self.writes.push_blob(repo, descriptor, body).await
    }
    async fn mount_blob(
        &self,
        from_repo: &str,
        to_repo: &str,
        digest: &Digest,
    ) -> Result<Descriptor, Error> {
        self.writes.mount_blob(from_repo, to_repo, digest).await
    }
    async fn list_tags(&self, repo: &str) -> Result<Vec<String>, Error> {
        self.reads.list_tags(repo).await
    }
}

fn connects_insecure(host: &str) -> bool {
    // assume localhost means HTTP (handy for local registries and tests)
    host == "localhost"
        || host.starts_with("localhost:")
        || host == "127.0.0.1"
        || host.starts_with("127.0.0.1:")
}

// one lazily-constructed client per host for the lifetime of the process, so every host gets a
// single rate limiter and a single in-memory object cache no matter how many callers there are
pub struct Clients {
    auth_store: Arc<AuthStore>,
    user_agent: String,
    hub_proxy_host: Option<String>,
    hub_limiter: Arc<HostLimiter>,
    clients: Mutex<HashMap<String, Arc<dyn Registry>>>,
    offline: bool,
}

impl Clients {
    pub fn from_env() -> Result<Self, Error> {
        let auth_store = match std::env::var_os("META_AUTH") {
            Some(path) => Arc::new(AuthStore::load(path)?),
            None => Arc::new(AuthStore::default()),
        };
        let user_agent = std::env::var("META_USER_AGENT")
            .ok()
            .filter(|ua| !ua.is_empty())
            .unwrap_or_else(|| format!("meta-pipeline/{}", env!("CARGO_PKG_VERSION")));
        let hub_proxy_host = std::env::var("DOCKERHUB_PUBLIC_PROXY_HOST")
            .ok()
            .filter(|host| !host.is_empty());
        Ok(Clients {
            auth_store,
            user_agent,
            hub_proxy_host,
            hub_limiter: docker_hub_limiter(),
            clients: Mutex::new(HashMap::new()),
            offline: false,
        })
    }

    // a pool that only ever serves pre-registered clients; unknown hosts are an error instead
    // of a network dial (tests run against this plus MemRegistry)
    pub fn offline() -> Self {
        Clients {
            auth_store: Arc::new(AuthStore::default()),
            user_agent: String::new(),
            hub_proxy_host: None,
            hub_limiter: docker_hub_limiter(),
            clients: Mutex::new(HashMap::new()),
            offline: true,
        }
    }

    pub fn register(&self, host: &str, client: Arc<dyn Registry>) {
        self.clients
            .lock()
            .unwrap()
            .insert(host.to_string(), client);
    }

    pub fn for_host(&self, host: &str) -> Result<Arc<dyn Registry>, Error> {
        if let Some(client) = self.clients.lock().unwrap().get(host) {
            return Ok(client.clone());
        }
        if self.offline {
            return Err(Error::UnknownHost(host.to_string()));
        }
        let client = self.build(host)?;
        Ok(self
            .clients
            .lock()
            .unwrap()
            .entry(host.to_string())
            .or_insert(client)
            .clone())
    }

    pub fn for_ref(&self, reference: &Reference) -> Result<Arc<dyn Registry>, Error> {
        self.for_host(&reference.host).context(reference)
    }

    fn build(&self, host: &str) -> Result<Arc<dyn Registry>, Error> {
        let limiter = (host == DOCKER_HUB_CANONICAL).then(|| self.hub_limiter.clone());

        let connect_host = if host == DOCKER_HUB_CANONICAL {
            DOCKER_HUB_CONNECT
        } else {
            host
        };
        let main = Arc::new(self.build_http(host, connect_host, limiter.clone())?);

        let client: Arc<dyn Registry> = match (&self.hub_proxy_host, host) {
            (Some(proxy_host), DOCKER_HUB_CANONICAL) => {
                // the mirror shares the Hub limiter so mirrored reads still count against the
                // same request budget
                let mirror = Arc::new(self.build_http(host, proxy_host, limiter)?);
                Arc::new(HubProxy::new(mirror, main))
            }
            _ => main,
        };

        Ok(Arc::new(CachingRegistry::new(client)))
    }

    fn build_http(
        &self,
        host: &str,
        connect_host: &str,
        limiter: Option<Arc<HostLimiter>>,
    ) -> Result<HttpRegistry, Error> {
        let insecure = connects_insecure(connect_host);
        let base = reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .redirect(reqwest::redirect::Policy::limited(2))
            .https_only(!insecure)
            .build()?;
        let http = reqwest_middleware::ClientBuilder::new(base)
            .with(RateLimitedRetry::new(limiter))
            .build();
        Ok(HttpRegistry::new(
            host,
            connect_host,
            insecure,
            http,
            self.auth_store.clone(),
        ))
    }
}
