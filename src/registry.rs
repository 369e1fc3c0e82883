use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::*;

/// Tag used when an image reference carries neither a tag nor a digest
pub const DEFAULT_TAG: &str = "latest";
/// Registry used when an image reference names no host
pub const DEFAULT_HOSTNAME: &str = "docker.io";
/// Repository prefix for single-segment references on the default registry
pub const DEFAULT_REPO_PREFIX: &str = "library";

// docker.io is only the canonical name; the registry API lives elsewhere
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

const MANIFEST_ACCEPT: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json"
);

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid image reference {0:?}")]
    InvalidReference(String),

    #[error("Registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Registry returned {status} for {url}")]
    Status { status: StatusCode, url: String },

    #[error("Registry authentication failed: {0}")]
    Auth(String),

    #[error("Could not parse registry response: {0}")]
    InvalidResponse(#[from] serde_json::Error),
}

/// An image reference split into the parts the registry API needs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    /// The reference as written by the user, minus tag and digest
    pub name: String,
    /// Registry host, e.g. `quay.io`
    pub registry: String,
    /// Repository path within the registry, e.g. `parflesh/sonarr`
    pub repository: String,
    pub tag: String,
    /// Set when the reference is already pinned (`name@sha256:...`)
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(image: &str) -> Result<Self, RegistryError> {
        let image = image.trim();
        if image.is_empty() {
            return Err(RegistryError::InvalidReference(image.into()));
        }

        let (without_digest, digest) = match image.split_once('@') {
            Some((_, "")) => return Err(RegistryError::InvalidReference(image.into())),
            Some((reference, digest)) => (reference, Some(digest.to_string())),
            None => (image, None),
        };

        // a ':' after the last '/' is a tag; before it, a registry port
        let (name, tag) = match without_digest.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => (name, Some(tag)),
            _ => (without_digest, None),
        };
        if tag == Some("") {
            return Err(RegistryError::InvalidReference(image.into()));
        }

        let parts: Vec<&str> = name.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(RegistryError::InvalidReference(image.into()));
        }

        let (registry, repository) = match parts.as_slice() {
            [image] => (
                DEFAULT_HOSTNAME.to_string(),
                format!("{DEFAULT_REPO_PREFIX}/{image}"),
            ),
            [user, image] => (DEFAULT_HOSTNAME.to_string(), format!("{user}/{image}")),
            [host @ .., user, image] => (host.join("/"), format!("{user}/{image}")),
            [] => return Err(RegistryError::InvalidReference(image.into())),
        };

        Ok(Self {
            name: name.to_string(),
            registry,
            repository,
            tag: tag.unwrap_or(DEFAULT_TAG).to_string(),
            digest,
        })
    }

    /// `name@digest`, the immutable form of this reference
    pub fn pinned(&self, digest: &str) -> String {
        format!("{}@{}", self.name, digest)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.digest {
            Some(digest) => write!(f, "{}@{}", self.name, digest),
            None => write!(f, "{}:{}", self.name, self.tag),
        }
    }
}

/// The parts of an image manifest the operator cares about
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    /// Content digest of the image config blob
    pub config_digest: String,
}

/// Read access to a container registry
#[async_trait::async_trait]
pub trait RegistryClient: Send + Sync {
    async fn manifest_for_tag(
        &self,
        registry: &str,
        repository: &str,
        tag: &str,
    ) -> Result<Manifest, RegistryError>;

    async fn tags(&self, registry: &str, repository: &str) -> Result<Vec<String>, RegistryError>;
}

#[derive(Clone, Debug)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

/// Registry client speaking the Docker Registry HTTP API v2
#[derive(Clone)]
pub struct HttpRegistryClient {
    http_client: reqwest::Client,
    credentials: Option<RegistryCredentials>,
    // replaces `https://<registry host>` when set
    base_url: Option<String>,
}

#[derive(Deserialize)]
struct ManifestResponse {
    config: ConfigDescriptor,
}

#[derive(Deserialize)]
struct ConfigDescriptor {
    digest: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// A parsed `WWW-Authenticate: Bearer ...` challenge
#[derive(Debug, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl HttpRegistryClient {
    pub fn new(credentials: Option<RegistryCredentials>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            credentials,
            base_url: None,
        }
    }

    /// Send every request to `base_url` regardless of the registry named in the image
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// GET a registry API path, answering a bearer challenge once if the registry asks for one
    async fn get(
        &self,
        registry: &str,
        path: &str,
        accept: Option<&str>,
    ) -> Result<reqwest::Response, RegistryError> {
        let url = match &self.base_url {
            Some(base_url) => format!("{}{path}", base_url.trim_end_matches('/')),
            None => format!("https://{}{path}", api_host(registry)),
        };

        let request = |token: Option<&str>| {
            let mut builder = self.http_client.get(&url);
            if let Some(accept) = accept {
                builder = builder.header(ACCEPT, accept);
            }
            match (token, &self.credentials) {
                (Some(token), _) => builder.bearer_auth(token),
                (None, Some(creds)) => builder.basic_auth(&creds.username, Some(&creds.password)),
                (None, None) => builder,
            }
        };

        let resp = request(None).send().await?;
        let resp = if resp.status() == StatusCode::UNAUTHORIZED {
            let challenge = resp
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|h| h.to_str().ok())
                .and_then(parse_bearer_challenge)
                .ok_or_else(|| {
                    RegistryError::Auth(format!("{url} requires authentication we cannot satisfy"))
                })?;
            let token = self.fetch_token(&challenge).await?;
            request(Some(&token)).send().await?
        } else {
            resp
        };

        if !resp.status().is_success() {
            return Err(RegistryError::Status {
                status: resp.status(),
                url,
            });
        }

        Ok(resp)
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> Result<String, RegistryError> {
        debug!("Requesting registry token from {}", challenge.realm);

        let mut query = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }
        if let Some(scope) = &challenge.scope {
            query.push(("scope", scope.as_str()));
        }

        let mut builder = self.http_client.get(&challenge.realm).query(&query);
        if let Some(creds) = &self.credentials {
            builder = builder.basic_auth(&creds.username, Some(&creds.password));
        }

        let resp = builder.send().await?;
        if !resp.status().is_success() {
            return Err(RegistryError::Auth(format!(
                "token endpoint {} returned {}",
                challenge.realm,
                resp.status()
            )));
        }

        let body: TokenResponse = serde_json::from_slice(&resp.bytes().await?)?;
        body.token.or(body.access_token).ok_or_else(|| {
            RegistryError::Auth(format!("token endpoint {} returned no token", challenge.realm))
        })
    }
}

#[async_trait::async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn manifest_for_tag(
        &self,
        registry: &str,
        repository: &str,
        tag: &str,
    ) -> Result<Manifest, RegistryError> {
        let resp = self
            .get(
                registry,
                &format!("/v2/{repository}/manifests/{tag}"),
                Some(MANIFEST_ACCEPT),
            )
            .await?;
        let manifest: ManifestResponse = serde_json::from_slice(&resp.bytes().await?)?;

        debug!(
            registry,
            repository,
            tag,
            digest = %manifest.config.digest,
            "Fetched image manifest"
        );

        Ok(Manifest {
            config_digest: manifest.config.digest,
        })
    }

    async fn tags(
        &self,
        registry: &str,
        repository: &str,
    ) -> Result<Vec<String>, RegistryError> {
        let resp = self
            .get(registry, &format!("/v2/{repository}/tags/list"), None)
            .await?;
        let tags: TagsResponse = serde_json::from_slice(&resp.bytes().await?)?;
        Ok(tags.tags.unwrap_or_default())
    }
}

fn api_host(registry: &str) -> &str {
    if registry == DEFAULT_HOSTNAME {
        DOCKER_HUB_API_HOST
    } else {
        registry
    }
}

fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let (scheme, params) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    static PARAM: OnceLock<Regex> = OnceLock::new();
    let mut params: HashMap<String, String> = PARAM
        .get_or_init(|| Regex::new(r#"(\w+)="([^"]*)""#).unwrap())
        .captures_iter(params)
        .map(|c| (c[1].to_ascii_lowercase(), c[2].to_string()))
        .collect();

    Some(BearerChallenge {
        realm: params.remove("realm")?,
        service: params.remove("service"),
        scope: params.remove("scope"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reference_with_host() {
        let image = ImageReference::parse("quay.io/parflesh/sonarr:latest").unwrap();
        assert_eq!(image.name, "quay.io/parflesh/sonarr");
        assert_eq!(image.registry, "quay.io");
        assert_eq!(image.repository, "parflesh/sonarr");
        assert_eq!(image.tag, "latest");
        assert_eq!(image.digest, None);
    }

    #[test]
    fn parse_reference_defaults_registry_and_tag() {
        let image = ImageReference::parse("lib/app").unwrap();
        assert_eq!(image.registry, "docker.io");
        assert_eq!(image.repository, "lib/app");
        assert_eq!(image.tag, "latest");

        let image = ImageReference::parse("sonarr:develop").unwrap();
        assert_eq!(image.name, "sonarr");
        assert_eq!(image.repository, "library/sonarr");
        assert_eq!(image.tag, "develop");
    }

    #[test]
    fn parse_reference_keeps_registry_port() {
        let image = ImageReference::parse("registry.local:5000/media/sonarr").unwrap();
        assert_eq!(image.registry, "registry.local:5000");
        assert_eq!(image.repository, "media/sonarr");
        assert_eq!(image.tag, "latest");
    }

    #[test]
    fn parse_reference_with_digest() {
        let image = ImageReference::parse("lib/app@sha256:abc123").unwrap();
        assert_eq!(image.name, "lib/app");
        assert_eq!(image.digest.as_deref(), Some("sha256:abc123"));
        assert_eq!(image.to_string(), "lib/app@sha256:abc123");
    }

    #[test]
    fn parse_reference_rejects_garbage() {
        for image in ["", "  ", "a//b", "app:", "app@", "/app"] {
            assert!(
                ImageReference::parse(image).is_err(),
                "{image:?} should not parse"
            );
        }
    }

    #[test]
    fn pinned_reference_drops_tag() {
        let image = ImageReference::parse("lib/app:latest").unwrap();
        assert_eq!(image.pinned("sha256:abc123"), "lib/app@sha256:abc123");
    }

    #[test]
    fn docker_hub_uses_api_host() {
        assert_eq!(api_host("docker.io"), "registry-1.docker.io");
        assert_eq!(api_host("quay.io"), "quay.io");
    }

    #[test]
    fn parses_bearer_challenge() {
        let challenge = parse_bearer_challenge(concat!(
            r#"Bearer realm="https://auth.docker.io/token","#,
            r#"service="registry.docker.io",scope="repository:library/sonarr:pull""#,
        ))
        .unwrap();

        assert_eq!(
            challenge,
            BearerChallenge {
                realm: "https://auth.docker.io/token".into(),
                service: Some("registry.docker.io".into()),
                scope: Some("repository:library/sonarr:pull".into()),
            }
        );
    }

    #[test]
    fn ignores_non_bearer_challenge() {
        assert_eq!(parse_bearer_challenge(r#"Basic realm="registry""#), None);
        assert_eq!(parse_bearer_challenge(r#"Bearer service="x""#), None);
    }

    #[test]
    fn manifest_response_reads_config_digest() {
        let manifest: ManifestResponse = serde_json::from_value(serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "size": 7023,
                "digest": "sha256:abc123"
            },
            "layers": []
        }))
        .unwrap();

        assert_eq!(manifest.config.digest, "sha256:abc123");
    }

    #[test]
    fn tags_response_tolerates_missing_list() {
        let tags: TagsResponse =
            serde_json::from_str(r#"{"name":"parflesh/sonarr","tags":["latest","3.0"]}"#).unwrap();
        assert_eq!(tags.tags.unwrap(), vec!["latest", "3.0"]);

        let tags: TagsResponse =
            serde_json::from_str(r#"{"name":"parflesh/sonarr","tags":null}"#).unwrap();
        assert_eq!(tags.tags, None);
    }

    #[test]
    fn challenge_params_in_any_order() {
        for _ in 0..2 {
            let challenge = parse_bearer_challenge(
                r#"bearer scope="repository:a/b:pull",realm="http://auth.local/token""#,
            )
            .unwrap();
            assert_eq!(challenge.realm, "http://auth.local/token");
            assert_eq!(challenge.service, None);
            assert_eq!(challenge.scope.as_deref(), Some("repository:a/b:pull"));
        }
    }

    mod transport {
        use std::net::TcpListener;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Mutex;

        use actix_web::http::header::{HeaderName, AUTHORIZATION, WWW_AUTHENTICATE};
        use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
        use serde_json::json;

        use super::super::*;

        const TOKEN: &str = "pull-token";
        // base64 of "reader:hunter2"
        const BASIC_READER: &str = "Basic cmVhZGVyOmh1bnRlcjI=";

        /// What the local registry saw
        #[derive(Default)]
        struct Seen {
            manifest_requests: AtomicUsize,
            token_requests: AtomicUsize,
            token_authorization: Mutex<Option<String>>,
            token_query: Mutex<String>,
        }

        struct Registry {
            base_url: String,
            seen: web::Data<Seen>,
        }

        fn header(req: &HttpRequest, name: HeaderName) -> String {
            req.headers()
                .get(name)
                .and_then(|h| h.to_str().ok())
                .unwrap_or_default()
                .to_owned()
        }

        async fn manifest(
            req: HttpRequest,
            path: web::Path<(String, String)>,
            base_url: web::Data<String>,
            seen: web::Data<Seen>,
        ) -> HttpResponse {
            seen.manifest_requests.fetch_add(1, Ordering::SeqCst);
            let (repository, tag) = path.into_inner();
            if repository != "media/sonarr" {
                return HttpResponse::NotFound().finish();
            }
            if header(&req, AUTHORIZATION) != format!("Bearer {TOKEN}") {
                let challenge = format!(
                    concat!(
                        r#"Bearer realm="{base_url}/token",service="registry.test","#,
                        r#"scope="repository:{repository}:pull""#
                    ),
                    base_url = base_url.get_ref(),
                    repository = repository,
                );
                return HttpResponse::Unauthorized()
                    .insert_header((WWW_AUTHENTICATE, challenge))
                    .finish();
            }
            HttpResponse::Ok().json(json!({
                "schemaVersion": 2,
                "config": {"digest": format!("sha256:{tag}-config")},
                "layers": []
            }))
        }

        async fn token(req: HttpRequest, seen: web::Data<Seen>) -> HttpResponse {
            seen.token_requests.fetch_add(1, Ordering::SeqCst);
            let authorization = header(&req, AUTHORIZATION);
            *seen.token_query.lock().unwrap() = req.query_string().to_owned();
            *seen.token_authorization.lock().unwrap() = Some(authorization.clone());
            if authorization != BASIC_READER {
                return HttpResponse::Unauthorized().finish();
            }
            HttpResponse::Ok().json(json!({"access_token": TOKEN}))
        }

        async fn tag_list() -> HttpResponse {
            HttpResponse::Ok().json(json!({"name": "media/sonarr", "tags": ["latest", "4.0"]}))
        }

        fn serve() -> Registry {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let base_url = format!("http://{}", listener.local_addr().unwrap());
            let seen = web::Data::new(Seen::default());

            let app_base_url = web::Data::new(base_url.clone());
            let app_seen = seen.clone();
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(app_base_url.clone())
                    .app_data(app_seen.clone())
                    .route("/token", web::get().to(token))
                    .route("/v2/media/sonarr/tags/list", web::get().to(tag_list))
                    .route("/v2/{repository:.+}/manifests/{tag}", web::get().to(manifest))
            })
            .workers(1)
            .listen(listener)
            .unwrap()
            .run();
            actix_web::rt::spawn(server);

            Registry { base_url, seen }
        }

        fn reader() -> Option<RegistryCredentials> {
            Some(RegistryCredentials {
                username: "reader".into(),
                password: "hunter2".into(),
            })
        }

        #[actix_web::test]
        async fn manifest_answers_bearer_challenge_once() {
            let registry = serve();
            let client = HttpRegistryClient::new(reader()).with_base_url(&registry.base_url);

            let manifest = client
                .manifest_for_tag("registry.test", "media/sonarr", "latest")
                .await
                .unwrap();

            assert_eq!(manifest.config_digest, "sha256:latest-config");
            assert_eq!(registry.seen.manifest_requests.load(Ordering::SeqCst), 2);
            assert_eq!(registry.seen.token_requests.load(Ordering::SeqCst), 1);
            assert_eq!(
                registry.seen.token_authorization.lock().unwrap().as_deref(),
                Some(BASIC_READER)
            );
            let query = registry.seen.token_query.lock().unwrap().clone();
            assert!(query.contains("service=registry.test"), "{query}");
            assert!(query.contains("scope=repository%3Amedia%2Fsonarr%3Apull"), "{query}");
        }

        #[actix_web::test]
        async fn rejected_token_request_is_an_auth_error() {
            let registry = serve();
            let client = HttpRegistryClient::new(None).with_base_url(&registry.base_url);

            let err = client
                .manifest_for_tag("registry.test", "media/sonarr", "latest")
                .await
                .unwrap_err();

            assert!(matches!(err, RegistryError::Auth(_)), "{err:?}");
            assert_eq!(registry.seen.manifest_requests.load(Ordering::SeqCst), 1);
            assert_eq!(
                registry.seen.token_authorization.lock().unwrap().as_deref(),
                Some("")
            );
        }

        #[actix_web::test]
        async fn missing_repository_is_a_status_error() {
            let registry = serve();
            let client = HttpRegistryClient::new(reader()).with_base_url(&registry.base_url);

            let err = client
                .manifest_for_tag("registry.test", "media/radarr", "latest")
                .await
                .unwrap_err();

            match err {
                RegistryError::Status { status, url } => {
                    assert_eq!(status, StatusCode::NOT_FOUND);
                    assert_eq!(
                        url,
                        format!("{}/v2/media/radarr/manifests/latest", registry.base_url)
                    );
                }
                other => panic!("unexpected error {other:?}"),
            }
            assert_eq!(registry.seen.token_requests.load(Ordering::SeqCst), 0);
        }

        #[actix_web::test]
        async fn lists_tags() {
            let registry = serve();
            let client = HttpRegistryClient::new(None).with_base_url(&registry.base_url);

            let tags = client.tags("registry.test", "media/sonarr").await.unwrap();

            assert_eq!(tags, vec!["latest", "4.0"]);
        }
    }
}
