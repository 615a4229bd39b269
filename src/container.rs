//! Create and manage containers.
//!
//! API Reference: <https://docs.docker.com/engine/api/v1.41/#tag/Container>

use std::{collections::HashMap, hash::Hash, iter::Peekable, time::Duration};

use hyper::Body;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use url::form_urlencoded;

use crate::{
    docker::Docker,
    errors::{Error, Result},
    gpu::DeviceRequest,
};

/// Interface for accessing and manipulating a docker container
pub struct Container<'docker> {
    docker: &'docker Docker,
    id: String,
}

impl<'docker> Container<'docker> {
    /// Exports an interface exposing operations against a container instance
    pub fn new<S>(
        docker: &'docker Docker,
        id: S,
    ) -> Self
    where
        S: Into<String>,
    {
        Container {
            docker,
            id: id.into(),
        }
    }

    /// Inspects the current docker container instance's details
    pub async fn inspect(&self) -> Result<ContainerDetails> {
        self.docker
            .get_json::<ContainerDetails>(&format!("/containers/{}/json", self.id)[..])
            .await
    }

    /// Start the container instance
    pub async fn start(&self) -> Result<()> {
        self.docker
            .post(&format!("/containers/{}/start", self.id)[..], None)
            .await?;
        Ok(())
    }

    /// Stop the container instance
    pub async fn stop(
        &self,
        wait: Option<Duration>,
    ) -> Result<()> {
        let mut path = vec![format!("/containers/{}/stop", self.id)];
        if let Some(w) = wait {
            let encoded = form_urlencoded::Serializer::new(String::new())
                .append_pair("t", &w.as_secs().to_string())
                .finish();

            path.push(encoded)
        }
        self.docker.post(&path.join("?"), None).await?;
        Ok(())
    }

    /// Rename the container instance
    pub async fn rename(
        &self,
        name: &str,
    ) -> Result<()> {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("name", name)
            .finish();
        self.docker
            .post(
                &format!("/containers/{}/rename?{}", self.id, query)[..],
                None,
            )
            .await?;
        Ok(())
    }

    /// Delete the container instance
    pub async fn remove(
        &self,
        opts: RmContainerOptions,
    ) -> Result<()> {
        let mut path = vec![format!("/containers/{}", self.id)];
        if let Some(query) = opts.serialize() {
            path.push(query)
        }
        self.docker.delete(&path.join("?")).await?;
        Ok(())
    }
}

/// Interface for docker containers
pub struct Containers<'docker> {
    docker: &'docker Docker,
}

impl<'docker> Containers<'docker> {
    /// Exports an interface for interacting with docker containers
    pub fn new(docker: &'docker Docker) -> Self {
        Containers { docker }
    }

    /// Returns a reference to a set of operations available to a specific container instance
    pub fn get<S>(
        &self,
        name: S,
    ) -> Container<'docker>
    where
        S: Into<String>,
    {
        Container::new(self.docker, name)
    }

    /// Creates a new container instance from the given options
    pub async fn create(
        &self,
        opts: &ContainerOptions,
    ) -> Result<ContainerCreateInfo> {
        let body: Body = opts.serialize()?.into();
        let mut path = vec!["/containers/create".to_owned()];

        if let Some(ref name) = opts.name {
            path.push(
                form_urlencoded::Serializer::new(String::new())
                    .append_pair("name", name)
                    .finish(),
            );
        }

        self.docker
            .post_json(&path.join("?"), Some((body, mime::APPLICATION_JSON)))
            .await
    }
}

/// Interface for building a new docker container from an existing image
#[derive(Serialize, Debug)]
pub struct ContainerOptions {
    pub name: Option<String>,
    params: HashMap<&'static str, Value>,
}

/// Function to insert a JSON value into a tree where the desired
/// location of the value is given as a path of JSON keys.
fn insert<'a, I, V>(
    key_path: &mut Peekable<I>,
    value: &V,
    parent_node: &mut Value,
) -> Result<()>
where
    V: Serialize,
    I: Iterator<Item = &'a str>,
{
    let local_key = match key_path.next() {
        Some(key) => key,
        None => return Ok(()),
    };

    if let Value::Object(map) = parent_node {
        if key_path.peek().is_some() {
            let node = map
                .entry(local_key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));

            insert(key_path, value, node)?;
        } else {
            map.insert(local_key.to_string(), serde_json::to_value(value)?);
        }
    }
    Ok(())
}

impl ContainerOptions {
    /// return a new instance of a builder for options
    pub fn builder(image: &str) -> ContainerOptionsBuilder {
        ContainerOptionsBuilder::new(image)
    }

    /// serialize options as a string
    pub fn serialize(&self) -> Result<String> {
        serde_json::to_string(&self.to_json()?).map_err(Error::from)
    }

    fn to_json(&self) -> Result<Value> {
        let mut body_members = Map::new();
        // The HostConfig element gets initialized to an empty object,
        // for backward compatibility.
        body_members.insert("HostConfig".to_string(), Value::Object(Map::new()));
        let mut body = Value::Object(body_members);
        self.parse_from(&self.params, &mut body)?;
        Ok(body)
    }

    fn parse_from<'a, K, V>(
        &self,
        params: &'a HashMap<K, V>,
        body: &mut Value,
    ) -> Result<()>
    where
        K: ToString + Eq + Hash,
        V: Serialize,
    {
        for (k, v) in params.iter() {
            let key_string = k.to_string();
            insert(&mut key_string.split('.').peekable(), v, body)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct ContainerOptionsBuilder {
    name: Option<String>,
    params: HashMap<&'static str, Value>,
}

impl ContainerOptionsBuilder {
    pub(crate) fn new(image: &str) -> Self {
        let mut params = HashMap::new();

        params.insert("Image", Value::String(image.to_owned()));
        ContainerOptionsBuilder { name: None, params }
    }

    pub fn name(
        &mut self,
        name: &str,
    ) -> &mut Self {
        self.name = Some(name.to_owned());
        self
    }

    /// Specify any bind mounts, taking the form of `/some/host/path:/some/container/path[:mode]`
    pub fn volumes(
        &mut self,
        volumes: Vec<&str>,
    ) -> &mut Self {
        self.params.insert("HostConfig.Binds", json!(volumes));
        self
    }

    /// Publish container port `srcport` on host port `hostport`
    pub fn expose(
        &mut self,
        srcport: u32,
        protocol: &str,
        hostport: u32,
    ) -> &mut Self {
        let mut exposedport: HashMap<String, String> = HashMap::new();
        exposedport.insert("HostPort".to_string(), hostport.to_string());

        // Carry over previous bindings so repeated calls accumulate
        let mut port_bindings: HashMap<String, Value> = HashMap::new();
        if let Some(Value::Object(previous)) = self.params.get("HostConfig.PortBindings") {
            for (key, val) in previous.iter() {
                port_bindings.insert(key.to_string(), val.clone());
            }
        }
        port_bindings.insert(
            format!("{}/{}", srcport, protocol),
            json!(vec![exposedport]),
        );

        self.params
            .insert("HostConfig.PortBindings", json!(port_bindings));

        // Replicate the port bindings over to the exposed ports config
        let mut exposed_ports: HashMap<String, Value> = HashMap::new();
        let empty_config: HashMap<String, Value> = HashMap::new();
        for key in port_bindings.keys() {
            exposed_ports.insert(key.to_string(), json!(empty_config));
        }

        self.params.insert("ExposedPorts", json!(exposed_ports));

        self
    }

    pub fn cmd(
        &mut self,
        cmds: Vec<&str>,
    ) -> &mut Self {
        self.params.insert("Cmd", json!(cmds));
        self
    }

    /// OCI runtime used to run the container, `nvidia` for the NVIDIA container runtime
    pub fn runtime(
        &mut self,
        runtime: &str,
    ) -> &mut Self {
        self.params.insert("HostConfig.Runtime", json!(runtime));
        self
    }

    /// Devices requested from device drivers, such as GPUs
    pub fn device_requests(
        &mut self,
        requests: Vec<DeviceRequest>,
    ) -> &mut Self {
        self.params
            .insert("HostConfig.DeviceRequests", json!(requests));
        self
    }

    pub fn build(&self) -> ContainerOptions {
        ContainerOptions {
            name: self.name.clone(),
            params: self.params.clone(),
        }
    }
}

/// Options for removing a container
#[derive(Default, Debug)]
pub struct RmContainerOptions {
    params: HashMap<&'static str, String>,
}

impl RmContainerOptions {
    /// return a new instance of a builder for options
    pub fn builder() -> RmContainerOptionsBuilder {
        RmContainerOptionsBuilder::default()
    }

    /// serialize options as a string. returns None if no options are defined
    pub fn serialize(&self) -> Option<String> {
        if self.params.is_empty() {
            None
        } else {
            Some(
                form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(&self.params)
                    .finish(),
            )
        }
    }
}

/// Builder interface for `RmContainerOptions`
#[derive(Default)]
pub struct RmContainerOptionsBuilder {
    params: HashMap<&'static str, String>,
}

impl RmContainerOptionsBuilder {
    /// Remove the anonymous volumes of the container too
    pub fn volumes(
        &mut self,
        remove: bool,
    ) -> &mut Self {
        self.params.insert("v", remove.to_string());
        self
    }

    pub fn build(&self) -> RmContainerOptions {
        RmContainerOptions {
            params: self.params.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    /// Id of the image the container runs
    pub image: String,
    pub config: ContainerConfig,
    pub state: State,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    /// Image reference the container was created from
    pub image: String,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct State {
    pub status: String,
    pub running: bool,
    #[serde(default)]
    pub restarting: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreateInfo {
    pub id: String,
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::GpuSelection;

    #[test]
    fn container_options_simple() {
        let builder = ContainerOptionsBuilder::new("test_image");
        let options = builder.build();

        assert_eq!(
            r#"{"HostConfig":{},"Image":"test_image"}"#,
            options.serialize().unwrap()
        );
    }

    #[test]
    fn container_options_expose() {
        let options = ContainerOptionsBuilder::new("vllm/vllm-openai:latest")
            .expose(8000, "tcp", 8000)
            .build();
        assert_eq!(
            r#"{"ExposedPorts":{"8000/tcp":{}},"HostConfig":{"PortBindings":{"8000/tcp":[{"HostPort":"8000"}]}},"Image":"vllm/vllm-openai:latest"}"#,
            options.serialize().unwrap()
        );
    }

    #[test]
    fn container_options_expose_accumulates() {
        let options = ContainerOptionsBuilder::new("test_image")
            .expose(80, "tcp", 8080)
            .expose(443, "tcp", 8443)
            .build();
        let body: Value = serde_json::from_str(&options.serialize().unwrap()).unwrap();
        assert_eq!(
            body["HostConfig"]["PortBindings"]["80/tcp"][0]["HostPort"],
            "8080"
        );
        assert_eq!(
            body["HostConfig"]["PortBindings"]["443/tcp"][0]["HostPort"],
            "8443"
        );
        assert_eq!(body["ExposedPorts"].as_object().unwrap().len(), 2);
    }

    #[test]
    fn container_options_gpu_runtime_and_binds() {
        let options = ContainerOptionsBuilder::new("test_image")
            .runtime("nvidia")
            .device_requests(vec![GpuSelection::All.device_request()])
            .volumes(vec!["/models/llama:/app/model:rw"])
            .cmd(vec!["--model", "/app/model/llama"])
            .build();
        let body: Value = serde_json::from_str(&options.serialize().unwrap()).unwrap();

        assert_eq!(body["HostConfig"]["Runtime"], "nvidia");
        assert_eq!(
            body["HostConfig"]["Binds"],
            json!(["/models/llama:/app/model:rw"])
        );
        assert_eq!(
            body["HostConfig"]["DeviceRequests"],
            json!([{"Driver": "", "Count": -1, "Capabilities": [["gpu"]]}])
        );
        assert_eq!(body["Cmd"], json!(["--model", "/app/model/llama"]));
    }

    #[test]
    fn rm_options_serialize() {
        assert_eq!(RmContainerOptions::default().serialize(), None);
        assert_eq!(
            RmContainerOptions::builder().volumes(true).build().serialize(),
            Some("v=true".to_owned())
        );
    }

    #[test]
    fn container_details_from_inspect() {
        let details: ContainerDetails = serde_json::from_str(
            r#"{
                "Id": "4fa6e0f0c678",
                "Name": "/vllm",
                "Image": "sha256:1d2e",
                "Config": {"Image": "vllm/vllm-openai:v0.4.0", "Cmd": ["--model", "/app/model/llama"]},
                "State": {"Status": "running", "Running": true, "Restarting": false},
                "HostConfig": {"Runtime": "nvidia"}
            }"#,
        )
        .unwrap();
        assert_eq!(details.config.image, "vllm/vllm-openai:v0.4.0");
        assert!(details.state.running);
        assert_eq!(details.config.labels, None);
    }
}
