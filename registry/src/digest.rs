use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

// digests are carried around in their string form ("sha256:<64 lower hex>") because that is
// what every wire format wants, but we validate up front so nothing downstream has to re-check

#[derive(Debug, thiserror::Error)]
#[error("invalid digest {0:?}")]
pub struct DigestParseError(pub String);

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    pub fn parse(s: &str) -> Result<Self, DigestParseError> {
        let Some((algorithm, encoded)) = s.split_once(':') else {
            return Err(DigestParseError(s.to_string()));
        };
        let hex_len = match algorithm {
            "sha256" => 64,
            "sha512" => 128,
            _ => return Err(DigestParseError(s.to_string())),
        };
        if encoded.len() != hex_len
            || !encoded
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(DigestParseError(s.to_string()));
        }
        Ok(Digest(s.to_string()))
    }

    // sha256 of the raw bytes; everything we push or hash ourselves is sha256
    pub fn from_bytes(data: impl AsRef<[u8]>) -> Self {
        Digest(format!("sha256:{}", hex::encode(Sha256::digest(data))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn algorithm(&self) -> &str {
        // unwrap is fine, the separator was checked at construction
        self.0.split_once(':').unwrap().0
    }

    pub fn encoded(&self) -> &str {
        self.0.split_once(':').unwrap().1
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Digest {
    type Err = DigestParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let d = Digest::parse(
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        )
        .unwrap();
        assert_eq!(d.algorithm(), "sha256");
        assert_eq!(
            d.encoded(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        for bad in [
            "",
            "sha256",
            "sha256:",
            // one short
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015a",
            // upper hex
            "sha256:BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD",
            // unknown algorithm
            "md5:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        ] {
            assert!(Digest::parse(bad).is_err(), "{:?}", bad);
        }
    }

    #[test]
    fn test_from_bytes() {
        assert_eq!(
            Digest::from_bytes("abc").as_str(),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_serde_round_trip() {
        let d = Digest::from_bytes(b"hello");
        let json = serde_json::to_string(&d).unwrap();
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
        assert!(serde_json::from_str::<Digest>("\"sha256:nope\"").is_err());
    }
}
