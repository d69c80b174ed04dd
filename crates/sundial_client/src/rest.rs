//! A platform implementation that talks to the orchestration platform's
//! REST API with a blocking client.

use std::path::PathBuf;
use std::time::Duration;

use backon::{BlockingRetryable, ExponentialBuilder};
use derive_setters::Setters;
use log::{trace, warn};
use reqwest::{
    blocking::{Client, ClientBuilder, Response},
    header::{HeaderMap, HeaderValue},
    StatusCode, Url,
};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DisplayFromStr};

use sundial_core::{
    codes,
    constants as names,
    ErrorKind, Platform, SnapshotApiVersion, SnapshotGroup, Status, SundialError, SundialResult,
    VolumeClaim,
};

/// joining URL failed on: `{0}`
#[derive(thiserror::Error, Clone, Copy, Debug, displaydoc::Display)]
pub struct JoiningUrlFailedError(url::ParseError);

pub(super) mod constants {
    use std::time::Duration;

    /// Default number of retries
    pub(super) const DEFAULT_RETRY: usize = 5;

    /// Default timeout for the client
    pub(super) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Options for connecting to the platform API.
#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Setters)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
#[setters(into)]
#[non_exhaustive]
pub struct RestOptions {
    /// Base URL of the platform API server
    #[cfg_attr(
        feature = "clap",
        clap(long, value_name = "URL", env = "SUNDIAL_API_URL")
    )]
    pub api_url: String,

    /// Bearer token used to authenticate
    #[cfg_attr(
        feature = "clap",
        clap(long, value_name = "TOKEN", env = "SUNDIAL_API_TOKEN")
    )]
    pub token: Option<String>,

    /// Path to a PEM file with an additional trusted root certificate
    #[cfg_attr(feature = "clap", clap(long, value_name = "FILE"))]
    pub cacert: Option<PathBuf>,

    /// Request timeout
    #[cfg_attr(
        feature = "clap",
        clap(long = "api-timeout", value_name = "DURATION", default_value = "30s")
    )]
    #[serde_as(as = "DisplayFromStr")]
    pub timeout: humantime::Duration,

    /// Number of client-side retries for transient request failures
    #[cfg_attr(feature = "clap", clap(long, value_name = "N", default_value = "5"))]
    pub retry: usize,

    /// Snapshot API version the platform speaks
    #[cfg_attr(
        feature = "clap",
        clap(long, value_name = "VERSION", value_enum, default_value = "v1beta1")
    )]
    pub snapshot_api_version: SnapshotApiVersion,
}

impl Default for RestOptions {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            token: None,
            cacert: None,
            timeout: constants::DEFAULT_TIMEOUT.into(),
            retry: constants::DEFAULT_RETRY,
            snapshot_api_version: SnapshotApiVersion::default(),
        }
    }
}

fn transport_error(err: reqwest::Error) -> Box<SundialError> {
    SundialError::with_source(ErrorKind::Platform, "Request to the platform failed.", err)
        .attach_status(Status::Temporary)
}

fn decode_error(err: reqwest::Error) -> Box<SundialError> {
    SundialError::with_source(
        ErrorKind::Platform,
        "Platform response could not be decoded.",
        err,
    )
    .attach_status(Status::Permanent)
}

/// Maps an unsuccessful response status to an error the engine and queue can
/// branch on.
fn status_error(status: StatusCode) -> Box<SundialError> {
    let err = SundialError::new(ErrorKind::Platform, "Platform responded with an error status.")
        .attach_context("status", status.to_string());
    match status {
        StatusCode::NOT_FOUND => err
            .attach_error_code(codes::NOT_FOUND)
            .attach_status(Status::Temporary),
        StatusCode::CONFLICT => err
            .attach_error_code(codes::CONFLICT)
            .attach_status(Status::Temporary),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            err.attach_status(Status::Temporary)
        }
        status if status.is_server_error() => err.attach_status(Status::Temporary),
        status if status.is_client_error() => err.attach_status(Status::Permanent),
        _ => err.attach_status(Status::Temporary),
    }
}

fn check(result: reqwest::Result<Response>) -> SundialResult<Response> {
    let response = result.map_err(transport_error)?;
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(status_error(status))
    }
}

fn construct_join_url_error(err: JoiningUrlFailedError, base: &Url, path: &str) -> Box<SundialError> {
    SundialError::with_source(ErrorKind::Internal, "Joining URL failed.", err)
        .attach_context("url", base.as_str().to_string())
        .attach_context("path", path.to_string())
}

/// List responses come wrapped in an `items` envelope.
#[derive(Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

/// A [`Platform`] over the orchestration platform's HTTP API.
#[derive(Clone, Debug)]
pub struct RestPlatform {
    /// The base url of the API server.
    base: Url,
    /// The client to use.
    client: Client,
    /// The ``BackoffBuilder`` we use
    backoff: ExponentialBuilder,
    /// The snapshot API version the platform speaks.
    snapshot_version: SnapshotApiVersion,
}

impl RestPlatform {
    /// Creates a new [`RestPlatform`] from the given options.
    ///
    /// # Errors
    ///
    /// * If no API URL was given or it cannot be parsed.
    /// * If the certificate file cannot be read.
    /// * If the client could not be built.
    pub fn new(options: &RestOptions) -> SundialResult<Self> {
        if options.api_url.is_empty() {
            return Err(SundialError::new(
                ErrorKind::InvalidInput,
                "No platform API URL given.",
            ));
        }

        let url = if options.api_url.ends_with('/') {
            options.api_url.clone()
        } else {
            // add a trailing '/' if there is none
            let mut url = options.api_url.clone();
            url.push('/');
            url
        };
        let base = Url::parse(&url).map_err(|err| {
            SundialError::with_source(ErrorKind::InvalidInput, "API URL parsing failed.", err)
                .attach_context("url", url)
        })?;

        let mut headers = HeaderMap::new();
        _ = headers.insert("User-Agent", HeaderValue::from_static("sundial"));
        if let Some(token) = &options.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|err| {
                SundialError::with_source(
                    ErrorKind::InvalidInput,
                    "The API token is not a valid header value.",
                    err,
                )
            })?;
            _ = headers.insert("Authorization", value);
        }

        let mut client_builder = ClientBuilder::new()
            .default_headers(headers)
            .timeout(*options.timeout);

        if let Some(path) = &options.cacert {
            let pem = std::fs::read(path).map_err(|err| {
                SundialError::with_source(ErrorKind::InvalidInput, "Cannot read cacert file.", err)
                    .attach_context("path", path.display().to_string())
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(|err| {
                SundialError::with_source(ErrorKind::InvalidInput, "Cannot parse cacert file.", err)
                    .attach_context("path", path.display().to_string())
            })?;
            client_builder = client_builder.add_root_certificate(certificate);
        }

        let client = client_builder.build().map_err(|err| {
            SundialError::with_source(ErrorKind::Platform, "Failed to build HTTP client.", err)
        })?;

        // no maximum elapsed time; we count number of retries
        let backoff = ExponentialBuilder::default()
            .with_max_delay(Duration::MAX)
            .with_max_times(options.retry);

        Ok(Self {
            base,
            client,
            backoff,
            snapshot_version: options.snapshot_api_version,
        })
    }

    /// Call the given operation retrying transient errors and giving
    /// warnings for failed operations.
    ///
    /// Not-found and conflict answers are handed straight back; retrying
    /// them client-side cannot change them, the work queue deals with those.
    fn retry_notify<F, T>(&self, op: F) -> SundialResult<T>
    where
        F: FnMut() -> SundialResult<T>,
    {
        op.retry(self.backoff)
            .when(|err: &Box<SundialError>| {
                err.is_temporary() && !err.is_not_found() && !err.is_conflict()
            })
            .notify(|err, duration| warn!("Error {err} at {duration:?}, retrying"))
            .call()
    }

    fn join(&self, path: &str) -> SundialResult<Url> {
        self.base
            .join(path)
            .map_err(|err| construct_join_url_error(JoiningUrlFailedError(err), &self.base, path))
    }

    /// URL of the cluster-wide group collection.
    fn groups_url(&self) -> SundialResult<Url> {
        self.join(&format!(
            "apis/{}/{}/{}",
            names::API_GROUP,
            names::API_VERSION,
            names::GROUP_PLURAL
        ))
    }

    /// URL of one group.
    fn group_url(&self, namespace: &str, name: &str) -> SundialResult<Url> {
        self.join(&format!(
            "apis/{}/{}/namespaces/{namespace}/{}/{name}",
            names::API_GROUP,
            names::API_VERSION,
            names::GROUP_PLURAL
        ))
    }

    /// URL of the claim collection of a namespace, or of one claim.
    fn claim_url(&self, namespace: &str, name: Option<&str>) -> SundialResult<Url> {
        let mut path = format!("api/v1/namespaces/{namespace}/persistentvolumeclaims");
        if let Some(name) = name {
            path.push('/');
            path.push_str(name);
        }
        self.join(&path)
    }

    /// URL of the snapshot collection of a namespace, or of one snapshot.
    fn snapshot_url(&self, namespace: &str, name: Option<&str>) -> SundialResult<Url> {
        let mut path = format!(
            "apis/{}/{}/namespaces/{namespace}/volumesnapshots",
            names::SNAPSHOT_API_GROUP,
            self.snapshot_version.version()
        );
        if let Some(name) = name {
            path.push('/');
            path.push_str(name);
        }
        self.join(&path)
    }
}

/// Serializes a typed object with the `apiVersion`/`kind` pair the platform
/// insists on for writes.
fn tag_payload<T: serde::Serialize>(
    object: &T,
    api_version: &str,
    kind: &str,
) -> SundialResult<Value> {
    let mut payload = serde_json::to_value(object).map_err(|err| {
        SundialError::with_source(ErrorKind::Internal, "Serializing the payload failed.", err)
    })?;
    if let Some(payload) = payload.as_object_mut() {
        let _ = payload.insert("apiVersion".to_string(), Value::String(api_version.to_string()));
        let _ = payload.insert("kind".to_string(), Value::String(kind.to_string()));
    }
    Ok(payload)
}

impl Platform for RestPlatform {
    fn location(&self) -> String {
        let mut location = "rest:".to_string();
        let mut url = self.base.clone();
        if url.password().is_some() {
            url.set_password(Some("***")).unwrap();
        }
        location.push_str(url.as_str());
        location
    }

    fn snapshot_version(&self) -> SnapshotApiVersion {
        self.snapshot_version
    }

    fn list_groups(&self) -> SundialResult<Vec<SnapshotGroup>> {
        trace!("listing snapshot groups");
        let url = self.groups_url()?;
        self.retry_notify(|| {
            let response = check(self.client.get(url.clone()).send())?;
            let list: ObjectList<SnapshotGroup> = response.json().map_err(decode_error)?;
            Ok(list.items)
        })
    }

    fn update_group(&self, group: &SnapshotGroup) -> SundialResult<SnapshotGroup> {
        trace!("updating snapshot group {}/{}", group.namespace(), group.name());
        let url = self.group_url(group.namespace(), group.name())?;
        let payload = tag_payload(
            group,
            &format!("{}/{}", names::API_GROUP, names::API_VERSION),
            "SnapshotGroup",
        )?;
        self.retry_notify(|| {
            let response = check(self.client.put(url.clone()).json(&payload).send())?;
            response.json().map_err(decode_error)
        })
    }

    fn get_claim(&self, namespace: &str, name: &str) -> SundialResult<VolumeClaim> {
        trace!("reading claim {namespace}/{name}");
        let url = self.claim_url(namespace, Some(name))?;
        self.retry_notify(|| {
            let response = check(self.client.get(url.clone()).send())?;
            response.json().map_err(decode_error)
        })
    }

    fn create_claim(&self, claim: &VolumeClaim) -> SundialResult<VolumeClaim> {
        trace!(
            "creating claim {}/{}",
            claim.metadata.namespace,
            claim.metadata.name
        );
        let url = self.claim_url(&claim.metadata.namespace, None)?;
        let payload = tag_payload(claim, "v1", "PersistentVolumeClaim")?;
        self.retry_notify(|| {
            let response = check(self.client.post(url.clone()).json(&payload).send())?;
            response.json().map_err(decode_error)
        })
    }

    fn delete_claim(&self, namespace: &str, name: &str) -> SundialResult<()> {
        trace!("deleting claim {namespace}/{name}");
        let url = self.claim_url(namespace, Some(name))?;
        self.retry_notify(|| {
            let _ = check(self.client.delete(url.clone()).send())?;
            Ok(())
        })
    }

    fn list_snapshots(&self, namespace: &str) -> SundialResult<Vec<Value>> {
        trace!("listing snapshots in {namespace}");
        let url = self.snapshot_url(namespace, None)?;
        self.retry_notify(|| {
            let response = check(self.client.get(url.clone()).send())?;
            let list: ObjectList<Value> = response.json().map_err(decode_error)?;
            Ok(list.items)
        })
    }

    fn get_snapshot(&self, namespace: &str, name: &str) -> SundialResult<Value> {
        trace!("reading snapshot {namespace}/{name}");
        let url = self.snapshot_url(namespace, Some(name))?;
        self.retry_notify(|| {
            let response = check(self.client.get(url.clone()).send())?;
            response.json().map_err(decode_error)
        })
    }

    fn create_snapshot(&self, namespace: &str, payload: Value) -> SundialResult<Value> {
        trace!("creating snapshot in {namespace}");
        let url = self.snapshot_url(namespace, None)?;
        self.retry_notify(|| {
            let response = check(self.client.post(url.clone()).json(&payload).send())?;
            response.json().map_err(decode_error)
        })
    }

    fn delete_snapshot(&self, namespace: &str, name: &str) -> SundialResult<()> {
        trace!("deleting snapshot {namespace}/{name}");
        let url = self.snapshot_url(namespace, Some(name))?;
        self.retry_notify(|| {
            let _ = check(self.client.delete(url.clone()).send())?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn platform() -> RestPlatform {
        RestPlatform::new(&RestOptions::default().api_url("https://platform.example")).unwrap()
    }

    #[test]
    fn a_missing_api_url_is_rejected() {
        assert!(RestPlatform::new(&RestOptions::default()).is_err());
    }

    #[test]
    fn urls_follow_the_platform_layout() {
        let platform = platform();
        assert_eq!(
            platform.groups_url().unwrap().as_str(),
            "https://platform.example/apis/sundial.fairwinds.com/v1beta1/snapshotgroups"
        );
        assert_eq!(
            platform.group_url("prod", "db").unwrap().as_str(),
            "https://platform.example/apis/sundial.fairwinds.com/v1beta1/namespaces/prod/snapshotgroups/db"
        );
        assert_eq!(
            platform.claim_url("prod", Some("db")).unwrap().as_str(),
            "https://platform.example/api/v1/namespaces/prod/persistentvolumeclaims/db"
        );
        assert_eq!(
            platform.snapshot_url("prod", None).unwrap().as_str(),
            "https://platform.example/apis/snapshot.storage.k8s.io/v1beta1/namespaces/prod/volumesnapshots"
        );
    }

    #[test]
    fn the_snapshot_path_tracks_the_api_version() {
        let options = RestOptions::default()
            .api_url("https://platform.example")
            .snapshot_api_version(SnapshotApiVersion::V1Alpha1);
        let platform = RestPlatform::new(&options).unwrap();
        assert_eq!(
            platform.snapshot_url("prod", None).unwrap().as_str(),
            "https://platform.example/apis/snapshot.storage.k8s.io/v1alpha1/namespaces/prod/volumesnapshots"
        );
    }

    #[rstest]
    #[case(StatusCode::NOT_FOUND, Some(codes::NOT_FOUND), true)]
    #[case(StatusCode::CONFLICT, Some(codes::CONFLICT), true)]
    #[case(StatusCode::TOO_MANY_REQUESTS, None, true)]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, None, true)]
    #[case(StatusCode::BAD_GATEWAY, None, true)]
    #[case(StatusCode::FORBIDDEN, None, false)]
    #[case(StatusCode::UNPROCESSABLE_ENTITY, None, false)]
    fn statuses_map_to_codes_and_permanence(
        #[case] status: StatusCode,
        #[case] code: Option<&str>,
        #[case] temporary: bool,
    ) {
        let err = status_error(status);
        if let Some(code) = code {
            assert!(err.is_code(code));
        }
        assert_eq!(err.is_temporary(), temporary);
    }

    #[test]
    fn payload_tagging_adds_api_version_and_kind() {
        let group = SnapshotGroup::default();
        let payload = tag_payload(&group, "sundial.fairwinds.com/v1beta1", "SnapshotGroup").unwrap();
        assert_eq!(payload["apiVersion"], "sundial.fairwinds.com/v1beta1");
        assert_eq!(payload["kind"], "SnapshotGroup");
    }
}
