//! Image version comparison and pod/image selection.

use crate::provider::{ImageInfo, PodInfo};

/// Decimal weight for a three-component version string, so that versions
/// compare component-wise: `weight("0.10.2") > weight("0.9.9")`.
///
/// Malformed or missing components weigh zero, which sorts broken version
/// strings last instead of failing the whole selection.
pub fn version_weight(version: &str) -> u64 {
    let mut parts = version.split('.');
    let mut component = |scale: u64| {
        parts
            .next()
            .and_then(|p| p.trim().parse::<u64>().ok())
            .unwrap_or(0)
            .saturating_mul(scale)
    };
    let major = component(1_000_000);
    let minor = component(1_000);
    let patch = component(1);
    major + minor + patch
}

/// Pick the pod/image pair carrying the newest image eligible for the
/// current environment. Dev images are only eligible when `want_dev` is set;
/// production deploys never boot a dev image.
///
/// Returns `None` when no pod offers an eligible image, which the caller
/// treats as no capacity.
pub fn select_pod_image(pods: &[PodInfo], want_dev: bool) -> Option<(u64, ImageInfo)> {
    pods.iter()
        .flat_map(|pod| {
            pod.images
                .iter()
                .filter(|image| image.is_dev == want_dev)
                .map(move |image| (pod.id, image))
        })
        .max_by_key(|(_, image)| version_weight(&image.version))
        .map(|(pod_id, image)| (pod_id, image.clone()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn image(name: &str, version: &str, is_dev: bool) -> ImageInfo {
        ImageInfo {
            name: name.to_string(),
            version: version.to_string(),
            is_dev,
        }
    }

    #[test]
    fn weight_orders_component_wise() {
        assert!(version_weight("0.10.2") > version_weight("0.9.9"));
        assert!(version_weight("1.0.0") > version_weight("0.999.999"));
        assert_eq!(version_weight("2.3.4"), 2_003_004);
    }

    #[test]
    fn malformed_versions_weigh_zero_components() {
        assert_eq!(version_weight("garbage"), 0);
        assert_eq!(version_weight("1.x.3"), 1_000_003);
        assert_eq!(version_weight(""), 0);
    }

    #[test]
    fn selects_newest_eligible_image_across_pods() {
        let pods = vec![
            PodInfo {
                id: 1,
                name: "pod-a".into(),
                images: vec![image("enclave-os", "0.3.5", false), image("enclave-os", "0.4.0", true)],
            },
            PodInfo {
                id: 2,
                name: "pod-b".into(),
                images: vec![image("enclave-os", "0.3.9", false)],
            },
        ];

        let (pod_id, chosen) = select_pod_image(&pods, false).unwrap();
        assert_eq!(pod_id, 2);
        assert_eq!(chosen.version, "0.3.9");

        // Dev environment picks the dev image even though a prod one exists.
        let (pod_id, chosen) = select_pod_image(&pods, true).unwrap();
        assert_eq!(pod_id, 1);
        assert_eq!(chosen.version, "0.4.0");
    }

    #[test]
    fn no_eligible_image_yields_none() {
        assert!(select_pod_image(&[], false).is_none());

        let pods = vec![PodInfo {
            id: 1,
            name: "pod-a".into(),
            images: vec![image("enclave-os", "0.4.0", true)],
        }];
        assert!(select_pod_image(&pods, false).is_none());
    }
}
