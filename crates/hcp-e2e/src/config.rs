//! Harness configuration
//!
//! Options are read once per process from `HCP_E2E_*` environment variables
//! and shared read-only between scenarios.
//!
//! ```bash
//! HCP_E2E_PLATFORM=aws                      # aws | none
//! HCP_E2E_AWS_REGION=us-east-1              # required for aws
//! HCP_E2E_ZONES=us-east-1a,us-east-1b,us-east-1c
//! HCP_E2E_BASE_DOMAIN=ci.example.com
//! HCP_E2E_RELEASE_IMAGE=quay.io/openshift-release-dev/ocp-release:4.17.0-x86_64
//! HCP_E2E_PULL_SECRET_FILE=/path/to/pull-secret.json
//! HCP_E2E_SIGNING_KEY_FILE=/path/to/sa-signing-key.pem   # optional
//! HCP_E2E_ARTIFACT_DIR=/tmp/artifacts                    # optional
//! HCP_E2E_NODE_POOL_REPLICAS=2
//! HCP_E2E_KMS_KEY_ARN=arn:aws:kms:...                    # custom config scenario
//! HCP_E2E_KMS_ROLE_ARN=arn:aws:iam::...                  # custom config scenario
//! HCP_E2E_PROXY_URL=http://proxy.internal:3128           # proxy scenario
//! HCP_E2E_REQUEST_SERVING_ISOLATION=true
//! HCP_E2E_POLL_INTERVAL_SECS=10
//! ```

use std::path::PathBuf;
use std::time::Duration;

use hcp_e2e_common::{Error, Result};

use crate::request::{KmsEncryption, Platform};

const ENV_PREFIX: &str = "HCP_E2E_";

/// Deadlines and poll cadence used by the harness
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HarnessTimeouts {
    /// Interval between evaluations of a readiness condition
    pub poll_interval: Duration,
    /// Time for a created cluster to pass its readiness checks
    pub provision: Duration,
    /// Time for the guest API to become reachable
    pub guest_client: Duration,
    /// Interval between checks for the break-glass certificate secret
    pub credential_poll_interval: Duration,
    /// Time for the break-glass certificate secret to appear
    pub credential: Duration,
    /// Time for a deleted cluster to disappear
    pub teardown: Duration,
}

impl Default for HarnessTimeouts {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            provision: Duration::from_secs(30 * 60),
            guest_client: Duration::from_secs(10 * 60),
            credential_poll_interval: Duration::from_secs(1),
            credential: Duration::from_secs(3 * 60),
            teardown: Duration::from_secs(15 * 60),
        }
    }
}

/// Process-wide harness options
#[derive(Clone, Debug)]
pub struct HarnessOptions {
    /// Platform scenarios provision on unless they pick one themselves
    pub platform: Platform,
    /// Directory receiving per-cluster artifacts
    pub artifact_dir: Option<PathBuf>,
    /// Service account token signing key (PEM)
    pub signing_key: Option<Vec<u8>>,
    /// Availability zones node pools are spread over
    pub zones: Vec<String>,
    /// Base DNS domain for cluster endpoints
    pub base_domain: String,
    /// Release image clusters run
    pub release_image: String,
    /// Pull secret (dockerconfigjson)
    pub pull_secret: Vec<u8>,
    /// Node replicas per node pool
    pub node_pool_replicas: i32,
    /// KMS encryption for the custom configuration scenario
    pub kms: Option<KmsEncryption>,
    /// Egress proxy for the proxy scenario
    pub proxy_url: Option<String>,
    /// Run the request-serving isolation scenario
    pub request_serving_isolation: bool,
    /// Prefix of generated cluster names
    pub cluster_prefix: String,
    /// Deadlines and poll cadence
    pub timeouts: HarnessTimeouts,
}

impl HarnessOptions {
    /// Options with defaults for everything not given
    pub fn new(
        platform: Platform,
        release_image: impl Into<String>,
        base_domain: impl Into<String>,
        pull_secret: Vec<u8>,
    ) -> Self {
        Self {
            platform,
            artifact_dir: None,
            signing_key: None,
            zones: Vec::new(),
            base_domain: base_domain.into(),
            release_image: release_image.into(),
            pull_secret,
            node_pool_replicas: 2,
            kms: None,
            proxy_url: None,
            request_serving_isolation: false,
            cluster_prefix: "e2e".to_string(),
            timeouts: HarnessTimeouts::default(),
        }
    }

    /// Load options from `HCP_E2E_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load options through a variable lookup function
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars { lookup: &lookup };

        let platform = match vars.optional("PLATFORM").as_deref() {
            None | Some("aws") | Some("AWS") => Platform::Aws {
                region: vars.required("AWS_REGION")?,
            },
            Some("none") | Some("None") => Platform::None,
            Some(other) => {
                return Err(Error::validation(format!(
                    "{ENV_PREFIX}PLATFORM: unsupported platform {other:?} (expected aws or none)"
                )))
            }
        };

        let pull_secret = read_file(&vars.required("PULL_SECRET_FILE")?, "PULL_SECRET_FILE")?;
        let mut options = Self::new(
            platform,
            vars.required("RELEASE_IMAGE")?,
            vars.required("BASE_DOMAIN")?,
            pull_secret,
        );

        options.artifact_dir = vars.optional("ARTIFACT_DIR").map(PathBuf::from);
        options.signing_key = vars
            .optional("SIGNING_KEY_FILE")
            .map(|path| read_file(&path, "SIGNING_KEY_FILE"))
            .transpose()?;
        options.zones = vars
            .optional("ZONES")
            .map(|z| {
                z.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        if let Some(replicas) = vars.parsed::<i32>("NODE_POOL_REPLICAS")? {
            if replicas < 0 {
                return Err(Error::validation(format!(
                    "{ENV_PREFIX}NODE_POOL_REPLICAS must not be negative, got {replicas}"
                )));
            }
            options.node_pool_replicas = replicas;
        }
        options.kms = match (vars.optional("KMS_KEY_ARN"), vars.optional("KMS_ROLE_ARN")) {
            (Some(key_arn), Some(role_arn)) => Some(KmsEncryption { key_arn, role_arn }),
            (None, None) => None,
            _ => {
                return Err(Error::validation(format!(
                    "{ENV_PREFIX}KMS_KEY_ARN and {ENV_PREFIX}KMS_ROLE_ARN must be set together"
                )))
            }
        };
        options.proxy_url = vars.optional("PROXY_URL");
        options.request_serving_isolation =
            vars.parsed::<bool>("REQUEST_SERVING_ISOLATION")?.unwrap_or(false);
        if let Some(prefix) = vars.optional("CLUSTER_PREFIX") {
            options.cluster_prefix = prefix;
        }

        let t = &mut options.timeouts;
        for (name, slot) in [
            ("POLL_INTERVAL_SECS", &mut t.poll_interval),
            ("PROVISION_TIMEOUT_SECS", &mut t.provision),
            ("GUEST_CLIENT_TIMEOUT_SECS", &mut t.guest_client),
            ("CREDENTIAL_TIMEOUT_SECS", &mut t.credential),
            ("TEARDOWN_TIMEOUT_SECS", &mut t.teardown),
        ] {
            if let Some(secs) = vars.parsed::<u64>(name)? {
                *slot = Duration::from_secs(secs);
            }
        }

        Ok(options)
    }
}

struct Vars<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Vars<'_> {
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, name: &str) -> Result<String> {
        self.optional(name)
            .ok_or_else(|| Error::validation(format!("{ENV_PREFIX}{name} is required")))
    }

    fn parsed<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.optional(name)
            .map(|v| {
                v.trim().parse::<T>().map_err(|e| {
                    Error::validation(format!("{ENV_PREFIX}{name}: invalid value {v:?}: {e}"))
                })
            })
            .transpose()
    }
}

fn read_file(path: &str, var: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| Error::validation(format!("{ENV_PREFIX}{var}: cannot read {path}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn pull_secret_file(tag: &str) -> String {
        let path = std::env::temp_dir().join(format!("hcp-e2e-pull-{tag}-{}", std::process::id()));
        std::fs::write(&path, br#"{"auths":{}}"#).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn missing_required_variable_is_named() {
        let err = HarnessOptions::from_lookup(lookup(&[("PLATFORM", "none")])).unwrap_err();
        assert!(err.to_string().contains("HCP_E2E_PULL_SECRET_FILE"));
    }

    #[test]
    fn aws_requires_region() {
        let err = HarnessOptions::from_lookup(lookup(&[])).unwrap_err();
        assert!(err.to_string().contains("HCP_E2E_AWS_REGION"));
    }

    #[test]
    fn full_configuration() {
        let pull = pull_secret_file("full");
        let options = HarnessOptions::from_lookup(lookup(&[
            ("PLATFORM", "aws"),
            ("AWS_REGION", "us-east-1"),
            ("ZONES", "us-east-1a, us-east-1b,,us-east-1c"),
            ("BASE_DOMAIN", "ci.example.com"),
            ("RELEASE_IMAGE", "quay.io/release:4.17"),
            ("PULL_SECRET_FILE", &pull),
            ("NODE_POOL_REPLICAS", "3"),
            ("REQUEST_SERVING_ISOLATION", "true"),
            ("POLL_INTERVAL_SECS", "2"),
        ]))
        .unwrap();

        assert_eq!(
            options.platform,
            Platform::Aws {
                region: "us-east-1".to_string()
            }
        );
        assert_eq!(options.zones, ["us-east-1a", "us-east-1b", "us-east-1c"]);
        assert_eq!(options.node_pool_replicas, 3);
        assert!(options.request_serving_isolation);
        assert_eq!(options.pull_secret, br#"{"auths":{}}"#);
        assert_eq!(options.timeouts.poll_interval, Duration::from_secs(2));
        assert_eq!(options.timeouts.teardown, HarnessTimeouts::default().teardown);
        assert!(options.kms.is_none());
    }

    #[test]
    fn half_configured_kms_is_rejected() {
        let pull = pull_secret_file("kms");
        let err = HarnessOptions::from_lookup(lookup(&[
            ("PLATFORM", "none"),
            ("BASE_DOMAIN", "ci.example.com"),
            ("RELEASE_IMAGE", "quay.io/release:4.17"),
            ("PULL_SECRET_FILE", &pull),
            ("KMS_KEY_ARN", "arn:aws:kms:us-east-1:1:key/abc"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("KMS_ROLE_ARN"));
    }

    #[test]
    fn invalid_number_is_rejected() {
        let pull = pull_secret_file("number");
        let err = HarnessOptions::from_lookup(lookup(&[
            ("PLATFORM", "none"),
            ("BASE_DOMAIN", "ci.example.com"),
            ("RELEASE_IMAGE", "quay.io/release:4.17"),
            ("PULL_SECRET_FILE", &pull),
            ("NODE_POOL_REPLICAS", "many"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
