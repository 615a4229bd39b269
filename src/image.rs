//! Pull and inspect images.
//!
//! API Reference: <https://docs.docker.com/engine/api/v1.41/#tag/Image>

use std::{collections::HashMap, fmt, iter};

use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::form_urlencoded;

use crate::{docker::Docker, errors::Result};

/// Tag pulled when a reference names neither a tag nor a digest
pub const DEFAULT_TAG: &str = "latest";

/// Interface for accessing and manipulating a named docker image
pub struct Image<'docker> {
    docker: &'docker Docker,
    name: String,
}

impl<'docker> Image<'docker> {
    /// Exports an interface for operations that may be performed against a named image
    pub fn new<S>(
        docker: &'docker Docker,
        name: S,
    ) -> Self
    where
        S: Into<String>,
    {
        Image {
            docker,
            name: name.into(),
        }
    }

    /// Inspects a named image's details
    pub async fn inspect(&self) -> Result<ImageDetails> {
        self.docker
            .get_json(&format!("/images/{}/json", self.name)[..])
            .await
    }
}

/// Interface for docker images
pub struct Images<'docker> {
    docker: &'docker Docker,
}

impl<'docker> Images<'docker> {
    /// Exports an interface for interacting with docker images
    pub fn new(docker: &'docker Docker) -> Self {
        Images { docker }
    }

    /// Returns a reference to a set of operations available for a named image
    pub fn get<S>(
        &self,
        name: S,
    ) -> Image<'docker>
    where
        S: Into<String>,
    {
        Image::new(self.docker, name)
    }

    /// Pull and create a new docker images from an existing image
    ///
    /// Yields the daemon's JSON progress messages. Failures after the pull has
    /// started are reported as a message carrying an `error` field.
    pub fn pull(
        &self,
        opts: &PullOptions,
    ) -> impl Stream<Item = Result<Value>> + Unpin + 'docker {
        let mut path = vec!["/images/create".to_owned()];
        if let Some(query) = opts.serialize() {
            path.push(query);
        }
        let headers = opts
            .auth_header()
            .map(|a| iter::once(("X-Registry-Auth", a)));

        Box::pin(
            self.docker
                .stream_post_into_values(path.join("?"), None, headers),
        )
    }
}

/// A parsed `[registry/]repository[:tag][@digest]` image reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    /// Splits a reference the way the docker cli does. A `:` only introduces a
    /// tag after the last `/`, so registry ports are left in the repository.
    pub fn parse(reference: &str) -> ImageReference {
        let (name, digest) = match reference.find('@') {
            Some(at) => (&reference[..at], Some(reference[at + 1..].to_owned())),
            None => (reference, None),
        };
        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        match name[last_slash..].rfind(':') {
            Some(colon) => {
                let colon = last_slash + colon;
                ImageReference {
                    repository: name[..colon].to_owned(),
                    tag: Some(name[colon + 1..].to_owned()),
                    digest,
                }
            }
            None => ImageReference {
                repository: name.to_owned(),
                tag: None,
                digest,
            },
        }
    }

    /// The value to pull for: the digest when pinned, else the tag or `latest`
    pub fn pull_tag(&self) -> &str {
        self.digest
            .as_deref()
            .or_else(|| self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        write!(f, "{}", self.repository)?;
        if let Some(ref tag) = self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(ref digest) = self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

#[derive(Clone, Serialize, Debug)]
#[serde(untagged)]
pub enum RegistryAuth {
    Password {
        username: String,
        password: String,

        #[serde(rename = "serveraddress")]
        #[serde(skip_serializing_if = "Option::is_none")]
        server_address: Option<String>,
    },
    Token {
        #[serde(rename = "identitytoken")]
        identity_token: String,
    },
}

impl RegistryAuth {
    /// return a new instance with token authentication
    pub fn token<S>(token: S) -> RegistryAuth
    where
        S: Into<String>,
    {
        RegistryAuth::Token {
            identity_token: token.into(),
        }
    }

    /// return a new instance of a builder for authentication
    pub fn builder() -> RegistryAuthBuilder {
        RegistryAuthBuilder::default()
    }

    /// serialize authentication as JSON in base64
    pub fn serialize(&self) -> String {
        serde_json::to_string(self)
            .map(|c| base64::encode_config(&c, base64::URL_SAFE))
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct RegistryAuthBuilder {
    username: Option<String>,
    password: Option<String>,
    server_address: Option<String>,
}

impl RegistryAuthBuilder {
    pub fn username<I>(
        &mut self,
        username: I,
    ) -> &mut Self
    where
        I: Into<String>,
    {
        self.username = Some(username.into());
        self
    }

    pub fn password<I>(
        &mut self,
        password: I,
    ) -> &mut Self
    where
        I: Into<String>,
    {
        self.password = Some(password.into());
        self
    }

    /// Registry the credentials belong to, such as `registry.example.com:5000`
    pub fn server_address<I>(
        &mut self,
        server_address: I,
    ) -> &mut Self
    where
        I: Into<String>,
    {
        self.server_address = Some(server_address.into());
        self
    }

    pub fn build(&self) -> RegistryAuth {
        RegistryAuth::Password {
            username: self.username.clone().unwrap_or_else(String::new),
            password: self.password.clone().unwrap_or_else(String::new),
            server_address: self.server_address.clone(),
        }
    }
}

#[derive(Default, Debug)]
pub struct PullOptions {
    auth: Option<RegistryAuth>,
    params: HashMap<&'static str, String>,
}

impl PullOptions {
    /// return a new instance of a builder for options
    pub fn builder() -> PullOptionsBuilder {
        PullOptionsBuilder::default()
    }

    /// serialize options as a string. returns None if no options are defined
    pub fn serialize(&self) -> Option<String> {
        if self.params.is_empty() {
            None
        } else {
            let mut params = self.params.iter().collect::<Vec<_>>();
            params.sort();
            Some(
                form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(params)
                    .finish(),
            )
        }
    }

    pub(crate) fn auth_header(&self) -> Option<String> {
        self.auth.clone().map(|a| a.serialize())
    }
}

#[derive(Default)]
pub struct PullOptionsBuilder {
    auth: Option<RegistryAuth>,
    params: HashMap<&'static str, String>,
}

impl PullOptionsBuilder {
    ///  Name of the image to pull. The name may include a tag or digest.
    /// If an untagged value is provided and no `tag` is provided, _all_
    /// tags will be pulled
    pub fn image<I>(
        &mut self,
        img: I,
    ) -> &mut Self
    where
        I: Into<String>,
    {
        self.params.insert("fromImage", img.into());
        self
    }

    /// Tag or digest. If empty when pulling an image,
    /// this causes all tags for the given image to be pulled.
    pub fn tag<T>(
        &mut self,
        t: T,
    ) -> &mut Self
    where
        T: Into<String>,
    {
        self.params.insert("tag", t.into());
        self
    }

    /// Pull exactly the referenced image, defaulting to `latest`
    pub fn reference(
        &mut self,
        reference: &ImageReference,
    ) -> &mut Self {
        self.image(reference.repository.clone())
            .tag(reference.pull_tag().to_owned())
    }

    pub fn auth(
        &mut self,
        auth: RegistryAuth,
    ) -> &mut Self {
        self.auth = Some(auth);
        self
    }

    pub fn build(&mut self) -> PullOptions {
        PullOptions {
            auth: self.auth.take(),
            params: self.params.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageDetails {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
    #[serde(default)]
    pub repo_digests: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test registry auth with token
    #[test]
    fn registry_auth_token() {
        let options = RegistryAuth::token("abc");
        assert_eq!(
            base64::encode(r#"{"identitytoken":"abc"}"#),
            options.serialize()
        );
    }

    /// Test registry auth with username and password
    #[test]
    fn registry_auth_password_simple() {
        let options = RegistryAuth::builder()
            .username("user_abc")
            .password("password_abc")
            .build();
        assert_eq!(
            base64::encode(r#"{"username":"user_abc","password":"password_abc"}"#),
            options.serialize()
        );
    }

    #[test]
    fn registry_auth_names_its_server() {
        let options = RegistryAuth::builder()
            .username("ops")
            .password("secret")
            .server_address("registry.local:5000")
            .build();
        assert_eq!(
            base64::encode(
                r#"{"username":"ops","password":"secret","serveraddress":"registry.local:5000"}"#
            ),
            options.serialize()
        );
    }

    #[test]
    fn reference_with_tag() {
        let reference = ImageReference::parse("vllm/vllm-openai:v0.4.2");
        assert_eq!(reference.repository, "vllm/vllm-openai");
        assert_eq!(reference.tag.as_deref(), Some("v0.4.2"));
        assert_eq!(reference.pull_tag(), "v0.4.2");
    }

    #[test]
    fn untagged_reference_pulls_latest() {
        let reference = ImageReference::parse("vllm/vllm-openai");
        assert_eq!(reference.tag, None);
        assert_eq!(reference.pull_tag(), "latest");
        assert_eq!(reference.to_string(), "vllm/vllm-openai");
    }

    #[test]
    fn registry_port_is_not_a_tag() {
        let reference = ImageReference::parse("registry.local:5000/team/vllm");
        assert_eq!(reference.repository, "registry.local:5000/team/vllm");
        assert_eq!(reference.pull_tag(), "latest");

        let reference = ImageReference::parse("registry.local:5000/team/vllm:nightly");
        assert_eq!(reference.repository, "registry.local:5000/team/vllm");
        assert_eq!(reference.pull_tag(), "nightly");
    }

    #[test]
    fn digest_wins_over_tag() {
        let reference = ImageReference::parse("vllm/vllm-openai:v0.4.2@sha256:abcd");
        assert_eq!(reference.repository, "vllm/vllm-openai");
        assert_eq!(reference.tag.as_deref(), Some("v0.4.2"));
        assert_eq!(reference.pull_tag(), "sha256:abcd");
        assert_eq!(reference.to_string(), "vllm/vllm-openai:v0.4.2@sha256:abcd");
    }

    #[test]
    fn pull_options_from_reference() {
        let options = PullOptions::builder()
            .reference(&ImageReference::parse("vllm/vllm-openai"))
            .build();
        assert_eq!(
            options.serialize(),
            Some("fromImage=vllm%2Fvllm-openai&tag=latest".to_owned())
        );
        assert_eq!(options.auth_header(), None);
    }
}
