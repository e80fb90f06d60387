//! Aurora cluster DNS analysis.
//!
//! Aurora exposes a writer endpoint
//! (`<cluster>.cluster-<id>.<region>.rds.amazonaws.com`), a reader endpoint
//! (`<cluster>.cluster-ro-<id>.<region>.rds.amazonaws.com`) and per-instance
//! endpoints (`<instance>.<id>.<region>.rds.amazonaws.com`). Candidate host
//! derivation is pure string parsing; no protocol concern.

/// Parsed Aurora endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuroraEndpoint {
    /// Cluster (or instance) name, the first DNS label
    pub name: String,
    /// Opaque cluster id label, without the `cluster-`/`cluster-ro-` prefix
    pub cluster_id: String,
    /// AWS region label
    pub region: String,
    /// True for the reader (`cluster-ro-`) endpoint
    pub is_reader: bool,
    /// True for writer/reader cluster endpoints, false for instance ones
    pub is_cluster: bool,
}

const DOMAIN_SUFFIX: &str = ".rds.amazonaws.com";

/// Recognize an Aurora endpoint in a connection URL host. Returns None for
/// anything that is not an RDS DNS name.
pub fn analyze(host: &str) -> Option<AuroraEndpoint> {
    let stripped = host.strip_suffix(DOMAIN_SUFFIX)?;
    let mut labels = stripped.split('.');
    let name = labels.next()?;
    let id_label = labels.next()?;
    let region = labels.next()?;
    if labels.next().is_some() || name.is_empty() || region.is_empty() {
        return None;
    }

    let (cluster_id, is_reader, is_cluster) = if let Some(id) = id_label.strip_prefix("cluster-ro-")
    {
        (id, true, true)
    } else if let Some(id) = id_label.strip_prefix("cluster-") {
        (id, false, true)
    } else {
        (id_label, false, false)
    };
    if cluster_id.is_empty() {
        return None;
    }

    Some(AuroraEndpoint {
        name: name.to_string(),
        cluster_id: cluster_id.to_string(),
        region: region.to_string(),
        is_reader,
        is_cluster,
    })
}

impl AuroraEndpoint {
    /// Writer cluster endpoint for this cluster
    pub fn writer_endpoint(&self) -> String {
        format!(
            "{}.cluster-{}.{}{}",
            self.name, self.cluster_id, self.region, DOMAIN_SUFFIX
        )
    }

    /// Reader cluster endpoint for this cluster
    pub fn reader_endpoint(&self) -> String {
        format!(
            "{}.cluster-ro-{}.{}{}",
            self.name, self.cluster_id, self.region, DOMAIN_SUFFIX
        )
    }

    /// Endpoint of a specific instance in the same cluster domain
    pub fn instance_endpoint(&self, instance: &str) -> String {
        format!(
            "{}.{}.{}{}",
            instance, self.cluster_id, self.region, DOMAIN_SUFFIX
        )
    }
}
