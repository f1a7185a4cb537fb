use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use log::trace;
use moka::{Expiry, future::Cache};
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;

use crate::client::Error;
use crate::reference::{DOCKER_HUB_HOSTS, is_docker_hub_host};

#[derive(Debug, Clone)]
pub enum Credential {
    UserPass(String, String),
}

// credentials per registry host, loaded once at startup
#[derive(Debug, Default)]
pub struct AuthStore {
    entries: BTreeMap<String, Credential>,
}

#[derive(Deserialize)]
struct StoredEntry {
    username: String,
    password: String,
}

impl AuthStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("reading {:?}: {}", path.as_ref(), e)))?;
        let stored: BTreeMap<String, StoredEntry> = serde_json::from_str(&contents)?;
        Ok(AuthStore {
            entries: stored
                .into_iter()
                .map(|(host, entry)| (host, Credential::UserPass(entry.username, entry.password)))
                .collect(),
        })
    }

    // for Docker Hub, display is docker.io, auth may be keyed under any of the historical
    // aliases, so a miss on a Hub host falls back through all of them before giving up
    pub fn entry_for(&self, host: &str) -> Option<&Credential> {
        if let Some(credential) = self.entries.get(host) {
            return Some(credential);
        }
        if is_docker_hub_host(host) {
            for hub_host in DOCKER_HUB_HOSTS {
                if hub_host.is_empty() {
                    continue;
                }
                if let Some(credential) = self.entries.get(*hub_host) {
                    return Some(credential);
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Pull,
    Push,
}

impl ScopeKind {
    fn actions(self) -> &'static str {
        match self {
            ScopeKind::Pull => "pull",
            ScopeKind::Push => "pull,push",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: String,
    pub scope: Option<String>,
}

// parse `Bearer realm="...",service="...",scope="..."` (in any order, with optional spaces)
pub fn parse_bearer_challenge(input: &str) -> Option<BearerChallenge> {
    use nom::{
        IResult, Parser,
        bytes::{complete::tag, take_until1},
        character::complete::{alpha1, char},
        multi::{many0, many1, separated_list0},
        sequence::{delimited, preceded, separated_pair, terminated},
    };
    fn parser(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
        preceded(
            terminated(tag("Bearer"), many1(tag(" "))),
            separated_list0(
                terminated(tag(","), many0(tag(" "))),
                separated_pair(
                    alpha1,
                    tag("="),
                    delimited(char('"'), take_until1("\""), char('"')),
                ),
            ),
        )
        .parse(input)
    }
    let (_, matches) = parser(input).ok()?;
    let (mut realm, mut service, mut scope) = (None, None, None);
    for (key, value) in matches {
        match key {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            "scope" => scope = Some(value.to_string()),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service: service?,
        scope,
    })
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
struct TokenKey(String);

#[derive(Clone)]
struct Token {
    token: String,
    expires_in: Duration,
}

#[derive(Default)]
struct ExpireToken;

impl Expiry<TokenKey, Token> for ExpireToken {
    fn expire_after_create(
        &self,
        _key: &TokenKey,
        value: &Token,
        _current_time: Instant,
    ) -> Option<Duration> {
        trace!("{_key:?} expires in {:?}", value.expires_in);
        Some(value.expires_in)
    }
}

// token cache per (host, repository, scope); tokens are scoped per repo even though some
// registries hand out broader ones, because just doing it is simpler than special-casing
pub struct TokenAuth {
    store: Arc<AuthStore>,
    cache: Cache<TokenKey, Token>,
}

pub fn basic_header(user: &str, pass: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))
}

impl TokenAuth {
    pub fn new(store: Arc<AuthStore>) -> Self {
        let cache = Cache::builder()
            .max_capacity(10_000_000)
            .weigher(|k: &TokenKey, v: &Token| {
                (k.0.len() + v.token.len()).try_into().unwrap_or(u32::MAX)
            })
            .expire_after(ExpireToken)
            .build();
        TokenAuth { store, cache }
    }

    fn key(host: &str, repo: &str, kind: ScopeKind) -> TokenKey {
        TokenKey(format!("{host}/{repo}:{}", kind.actions()))
    }

    // a previously acquired (unexpired) Authorization header value, if any
    pub async fn cached_header(&self, host: &str, repo: &str, kind: ScopeKind) -> Option<String> {
        self.cache
            .get(&Self::key(host, repo, kind))
            .await
            .map(|token| format!("Bearer {}", token.token))
    }

    // acquire (or reuse) a token for the challenge the registry just sent us; anonymous when we
    // hold no credentials for the host
    pub async fn challenge_header(
        &self,
        http: &ClientWithMiddleware,
        host: &str,
        repo: &str,
        kind: ScopeKind,
        challenge: &BearerChallenge,
    ) -> Result<String, Error> {
        let key = Self::key(host, repo, kind);
        let credential = self.store.entry_for(host).cloned();
        let entry = self
            .cache
            .entry(key)
            .or_try_insert_with(fetch_token(http, credential, challenge, repo, kind))
            .await
            .map_err(|e: Arc<Error>| Error::Token(e.to_string()))?;
        if entry.is_fresh() {
            trace!("got new token for {}", entry.key().0);
        }
        Ok(format!("Bearer {}", entry.into_value().token))
    }
}

async fn fetch_token(
    http: &ClientWithMiddleware,
    credential: Option<Credential>,
    challenge: &BearerChallenge,
    repo: &str,
    kind: ScopeKind,
) -> Result<Token, Error> {
    #[derive(Deserialize)]
    struct TokenResponse {
        token: Option<String>,
        access_token: Option<String>,
        expires_in: Option<u64>,
    }

    let scope = challenge
        .scope
        .clone()
        .unwrap_or_else(|| format!("repository:{repo}:{}", kind.actions()));

    let mut request = http
        .get(&challenge.realm)
        .query(&[("service", challenge.service.as_str()), ("scope", scope.as_str())]);
    if let Some(Credential::UserPass(user, pass)) = &credential {
        request = request.header(http::header::AUTHORIZATION, basic_header(user, pass));
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(Error::Token(format!(
            "token endpoint {} returned {}",
            challenge.realm,
            response.status()
        )));
    }
    let body: TokenResponse = response.json().await?;
    let token = body
        .token
        .or(body.access_token)
        .ok_or_else(|| Error::Token(format!("no token in response from {}", challenge.realm)))?;
    // the distribution token spec gives 60 seconds as the default lifetime
    let expires_in = Duration::from_secs(body.expires_in.unwrap_or(60));
    Ok(Token { token, expires_in })
}
