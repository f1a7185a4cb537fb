use std::collections::BTreeMap;

use once_cell::sync::Lazy;

use crate::spec::Platform;

// the fixed table of architectures the image library builds for, keyed by the short arch name
// used in build annotations and staging templates
pub static SUPPORTED_ARCHES: Lazy<BTreeMap<&'static str, Platform>> = Lazy::new(|| {
    fn platform(os: &str, architecture: &str, variant: Option<&str>) -> Platform {
        Platform {
            architecture: architecture.to_string(),
            os: os.to_string(),
            os_version: None,
            os_features: None,
            variant: variant.map(str::to_string),
        }
    }
    BTreeMap::from([
        ("amd64", platform("linux", "amd64", None)),
        ("arm32v5", platform("linux", "arm", Some("v5"))),
        ("arm32v6", platform("linux", "arm", Some("v6"))),
        ("arm32v7", platform("linux", "arm", Some("v7"))),
        ("arm64v8", platform("linux", "arm64", Some("v8"))),
        ("i386", platform("linux", "386", None)),
        ("mips64le", platform("linux", "mips64le", None)),
        ("ppc64le", platform("linux", "ppc64le", None)),
        ("riscv64", platform("linux", "riscv64", None)),
        ("s390x", platform("linux", "s390x", None)),
        ("windows-amd64", platform("windows", "amd64", None)),
    ])
});

// registries are inconsistent about variants, so fill in the implied ones and drop fields that
// never participate in matching
pub fn normalize(mut platform: Platform) -> Platform {
    platform.os_features = None;
    match platform.architecture.as_str() {
        "arm64" => platform.variant = Some("v8".to_string()),
        "arm" => {
            if platform.variant.is_none() {
                platform.variant = Some("v7".to_string());
            }
        }
        _ => {}
    }
    platform
}

fn platforms_match(a: &Platform, b: &Platform) -> bool {
    a.os == b.os && a.architecture == b.architecture && a.variant == b.variant
}

// the short arch name for a platform, if it is one we build for
pub fn arch_for_platform(platform: &Platform) -> Option<&'static str> {
    let normalized = normalize(platform.clone());
    SUPPORTED_ARCHES
        .iter()
        .find(|(_, supported)| platforms_match(&normalized, supported))
        .map(|(arch, _)| *arch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(os: &str, architecture: &str, variant: Option<&str>) -> Platform {
        Platform {
            architecture: architecture.to_string(),
            os: os.to_string(),
            os_version: None,
            os_features: None,
            variant: variant.map(str::to_string),
        }
    }

    #[test]
    fn test_normalize_variants() {
        assert_eq!(
            normalize(platform("linux", "arm64", None)).variant.as_deref(),
            Some("v8")
        );
        assert_eq!(
            normalize(platform("linux", "arm", None)).variant.as_deref(),
            Some("v7")
        );
        assert_eq!(
            normalize(platform("linux", "arm", Some("v6"))).variant.as_deref(),
            Some("v6")
        );
        assert_eq!(normalize(platform("linux", "amd64", None)).variant, None);
    }

    #[test]
    fn test_arch_for_platform() {
        assert_eq!(
            arch_for_platform(&platform("linux", "amd64", None)),
            Some("amd64")
        );
        assert_eq!(
            arch_for_platform(&platform("linux", "arm64", None)),
            Some("arm64v8")
        );
        assert_eq!(
            arch_for_platform(&platform("linux", "arm", Some("v7"))),
            Some("arm32v7")
        );
        assert_eq!(
            arch_for_platform(&platform("windows", "amd64", None)),
            Some("windows-amd64")
        );
        assert_eq!(arch_for_platform(&platform("plan9", "amd64", None)), None);
    }
}
