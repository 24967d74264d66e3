use k8s_openapi::api::core::v1::PersistentVolumeClaim;

/// Parse a cluster capacity quantity (e.g., "16Gi", "1073741824",
/// "500M") into bytes. Returns `None` for anything unparseable.
pub fn parse_quantity(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let suffixes: [(&str, i64); 12] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("Pi", 1 << 50),
        ("Ei", 1 << 60),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
        ("P", 1_000_000_000_000_000),
        ("E", 1_000_000_000_000_000_000),
    ];

    for (suffix, multiplier) in suffixes {
        if let Some(num) = s.strip_suffix(suffix) {
            let value: f64 = num.parse().ok()?;
            return Some((value * multiplier as f64) as i64);
        }
    }

    // Plain bytes
    s.parse::<i64>().ok()
}

/// Read the requested storage bytes from a claim, if any.
pub fn claim_request_bytes(claim: &PersistentVolumeClaim) -> Option<i64> {
    let requests = claim.spec.as_ref()?.resources.as_ref()?.requests.as_ref()?;
    let quantity = requests.get("storage")?;
    parse_quantity(&quantity.0)
}

/// Translate requested bytes into plugin sizing units.
///
/// Returns `⌊bytes / factor⌋` when both are positive, otherwise 0
/// (0 means "no size requested" to the options engine).
pub fn size_for_factor(bytes: i64, factor: i64) -> i64 {
    if bytes <= 0 || factor <= 0 {
        return 0;
    }
    bytes / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, VolumeResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    const GIB: i64 = 1 << 30;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("1024"), Some(1024));
        assert_eq!(parse_quantity("1Ki"), Some(1024));
        assert_eq!(parse_quantity("16Gi"), Some(16 * GIB));
        assert_eq!(parse_quantity("500M"), Some(500_000_000));
        assert_eq!(parse_quantity("2Ti"), Some(2i64 << 40));
        assert_eq!(parse_quantity(""), None);
        assert_eq!(parse_quantity("abc"), None);
    }

    #[test]
    fn test_size_for_factor() {
        assert_eq!(size_for_factor(16 * GIB, GIB), 16);
        assert_eq!(size_for_factor(17179869184, GIB), 16);
        // Truncating division
        assert_eq!(size_for_factor(3 * GIB / 2, GIB), 1);
        // Invalid inputs collapse to "no size"
        assert_eq!(size_for_factor(0, GIB), 0);
        assert_eq!(size_for_factor(-5, GIB), 0);
        assert_eq!(size_for_factor(16 * GIB, 0), 0);
    }

    #[test]
    fn test_claim_request_bytes() {
        let mut claim = PersistentVolumeClaim::default();
        assert_eq!(claim_request_bytes(&claim), None);

        claim.spec = Some(PersistentVolumeClaimSpec {
            resources: Some(VolumeResourceRequirements {
                requests: Some(
                    [("storage".to_string(), Quantity("16Gi".to_string()))]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(claim_request_bytes(&claim), Some(16 * GIB));
    }
}
