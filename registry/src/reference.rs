use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::digest::Digest;

pub const DOCKER_HUB_CANONICAL: &str = "docker.io";
// requests to Docker Hub actually connect here, thanks to a lot of mostly uninteresting history
pub const DOCKER_HUB_CONNECT: &str = "registry-1.docker.io";

// every hostname that means "Docker Hub"; "" is what a bare repository parses to
pub const DOCKER_HUB_HOSTS: &[&str] = &[
    "",
    "docker.io",
    "index.docker.io",
    "registry-1.docker.io",
    "registry.hub.docker.com",
];

pub fn is_docker_hub_host(host: &str) -> bool {
    DOCKER_HUB_HOSTS.contains(&host)
}

#[derive(Debug, thiserror::Error)]
#[error("invalid reference {0:?}")]
pub struct RefParseError(pub String);

// a parsed registry reference; both tag and digest may be present at once (the digest wins for
// identity, but keeping the tag around is useful for display and push-by-tag)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Reference {
    pub host: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

fn looks_like_host(s: &str) -> bool {
    s == "localhost" || s.contains('.') || s.contains(':')
}

fn valid_host(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b':' | b'-'))
}

fn valid_repo_component(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-'))
        && (s.as_bytes()[0].is_ascii_lowercase() || s.as_bytes()[0].is_ascii_digit())
        && (s.as_bytes()[s.len() - 1].is_ascii_lowercase()
            || s.as_bytes()[s.len() - 1].is_ascii_digit())
}

fn valid_repository(s: &str) -> bool {
    !s.is_empty() && s.split('/').all(valid_repo_component)
}

fn valid_tag(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && (s.as_bytes()[0].is_ascii_alphanumeric() || s.as_bytes()[0] == b'_')
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

impl Reference {
    // parse a reference like "hello-world:latest" with Docker Hub canonicalization applied:
    // any Hub alias host becomes "docker.io" and a bare repository gains the "library/" prefix.
    // explicitly does *not* default a missing tag to "latest"; callers that care can tell the
    // difference between "no tag" and ":latest" this way
    pub fn parse(s: &str) -> Result<Self, RefParseError> {
        let err = || RefParseError(s.to_string());

        let (rest, digest) = match s.split_once('@') {
            Some((rest, digest)) => (rest, Some(Digest::parse(digest).map_err(|_| err())?)),
            None => (s, None),
        };

        let (rest, tag) = match rest.rfind(':') {
            Some(i) if i > rest.rfind('/').map_or(0, |j| j) || !rest.contains('/') => {
                let (rest, tag) = (&rest[..i], &rest[i + 1..]);
                if !valid_tag(tag) {
                    return Err(err());
                }
                (rest, Some(tag.to_string()))
            }
            _ => (rest, None),
        };

        let (host, repository) = match rest.split_once('/') {
            Some((first, remainder)) if looks_like_host(first) => {
                if !valid_host(first) {
                    return Err(err());
                }
                (first.to_string(), remainder.to_string())
            }
            _ => (String::new(), rest.to_string()),
        };

        if !valid_repository(&repository) {
            return Err(err());
        }

        let mut reference = Reference {
            host,
            repository,
            tag,
            digest,
        };
        if is_docker_hub_host(&reference.host) {
            reference.host = DOCKER_HUB_CANONICAL.to_string();
            if !reference.repository.contains('/') {
                reference.repository = format!("library/{}", reference.repository);
            }
        }
        Ok(reference)
    }

    pub fn with_digest(&self, digest: Digest) -> Reference {
        let mut reference = self.clone();
        reference.digest = Some(digest);
        reference
    }

    // the tag to actually ask a registry for when neither tag nor digest was given
    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }
}

impl fmt::Display for Reference {
    // the inverse of parse: the canonical Hub host is elided, and so is a "library/" prefix
    // (but only for two-component Hub repositories, so the output re-parses to the same value)
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.host == DOCKER_HUB_CANONICAL {
            match self.repository.strip_prefix("library/") {
                Some(short) if !short.contains('/') => f.write_str(short)?,
                _ => f.write_str(&self.repository)?,
            }
        } else {
            if !self.host.is_empty() {
                write!(f, "{}/", self.host)?;
            }
            f.write_str(&self.repository)?;
        }
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl FromStr for Reference {
    type Err = RefParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reference::parse(s)
    }
}

impl Serialize for Reference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Reference::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonicalized() {
        for (input, output) in [
            ("hello-world:latest", "hello-world:latest"),
            ("tianon/true:oci", "tianon/true:oci"),
            ("docker.io/tianon/true:oci", "tianon/true:oci"),
            ("localhost:5000/foo", "localhost:5000/foo"),
            ("ghcr.io/foo/bar:baz", "ghcr.io/foo/bar:baz"),
            // Docker Hub edge cases
            ("hello-world", "hello-world"),
            ("library/hello-world", "hello-world"),
            ("docker.io/hello-world", "hello-world"),
            ("docker.io/library/hello-world", "hello-world"),
            ("index.docker.io/library/hello-world", "hello-world"),
            ("registry-1.docker.io/library/hello-world", "hello-world"),
            ("registry.hub.docker.com/library/hello-world", "hello-world"),
        ] {
            let reference = Reference::parse(input).unwrap();
            assert_eq!(reference.to_string(), output, "{:?}", input);
        }
    }

    #[test]
    fn test_parse_fields() {
        let reference = Reference::parse("index.docker.io/hello-world").unwrap();
        assert_eq!(reference.host, "docker.io");
        assert_eq!(reference.repository, "library/hello-world");
        assert_eq!(reference.tag, None);
        assert_eq!(reference.digest, None);

        let digest = "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        let reference =
            Reference::parse(&format!("localhost:5000/example:test@{}", digest)).unwrap();
        assert_eq!(reference.host, "localhost:5000");
        assert_eq!(reference.repository, "example");
        assert_eq!(reference.tag.as_deref(), Some("test"));
        assert_eq!(reference.digest.as_ref().map(|d| d.as_str()), Some(digest));
        // both tag and digest survive the textual form
        assert_eq!(
            reference.to_string(),
            format!("localhost:5000/example:test@{}", digest)
        );
    }

    #[test]
    fn test_round_trip_idempotent() {
        for input in [
            "hello-world",
            "hello-world:latest",
            "tianon/true:oci",
            "localhost:5000/foo:bar",
            "ghcr.io/foo/bar@sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        ] {
            let once = Reference::parse(input).unwrap();
            let twice = Reference::parse(&once.to_string()).unwrap();
            assert_eq!(once, twice, "{:?}", input);
            assert_eq!(once.to_string(), twice.to_string(), "{:?}", input);
        }
    }

    #[test]
    fn test_parse_rejects() {
        for bad in [
            "",
            "UPPER/case",
            "foo//bar",
            "foo:",
            "foo@sha256:short",
            "-leading/dash",
        ] {
            assert!(Reference::parse(bad).is_err(), "{:?}", bad);
        }
    }

    #[test]
    fn test_serde_text_form() {
        let reference: Reference = serde_json::from_str("\"docker.io/hello-world\"").unwrap();
        assert_eq!(serde_json::to_string(&reference).unwrap(), "\"hello-world\"");
    }
}
