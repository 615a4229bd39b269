//! Replace a running inference container with one built from a new image.
//!
//! The replacement keeps the container name and gets the port, GPU and model
//! volume configuration described by [SwapOptions]. The old container is
//! stopped, the new image pulled, then the old container is removed (or
//! renamed aside) so the name can be reused.

use std::{
    env, fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use futures_util::TryStreamExt;

use crate::{
    container::{ContainerOptions, RmContainerOptions},
    docker::Docker,
    errors::{Error, Result},
    gpu::GpuSelection,
    image::{ImageReference, PullOptions, RegistryAuth},
};

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_RUNTIME: &str = "nvidia";
pub const DEFAULT_MOUNT_TARGET: &str = "/app/model";
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Suffix given to the old container when it is kept
pub const PREVIOUS_SUFFIX: &str = "-previous";

/// Everything needed to swap a container onto a new image
#[derive(Clone, Debug)]
pub struct SwapOptions {
    pub container_name: String,
    pub image: ImageReference,
    /// absolute host path of the model directory
    pub model_path: PathBuf,
    pub model_name: String,
    pub port: u16,
    pub gpus: GpuSelection,
    pub runtime: String,
    pub mount_target: String,
    pub stop_timeout: Duration,
    pub keep_previous: bool,
    /// also remove the anonymous volumes of the old container
    pub remove_volumes: bool,
    pub auth: Option<RegistryAuth>,
}

impl SwapOptions {
    /// return a new instance of a builder for options
    pub fn builder<N, I, P>(
        container_name: N,
        image: I,
        model_path: P,
    ) -> SwapOptionsBuilder
    where
        N: Into<String>,
        I: AsRef<str>,
        P: Into<PathBuf>,
    {
        SwapOptionsBuilder::new(container_name.into(), image.as_ref(), model_path.into())
    }

    /// Arguments handed to the inference server
    pub fn command(&self) -> Vec<String> {
        vec![
            "--model".to_owned(),
            format!(
                "{}/{}",
                self.mount_target.trim_end_matches('/'),
                self.model_name
            ),
        ]
    }

    /// Bind mount of the model directory, read-write
    pub fn model_bind(&self) -> String {
        format!("{}:{}:rw", self.model_path.display(), self.mount_target)
    }

    /// Name the old container is moved to when it is kept
    pub fn previous_name(&self) -> String {
        format!("{}{}", self.container_name, PREVIOUS_SUFFIX)
    }

    /// Options for creating the replacement container
    pub fn container_options(&self) -> ContainerOptions {
        let image = self.image.to_string();
        let bind = self.model_bind();
        let command = self.command();
        ContainerOptions::builder(&image)
            .name(&self.container_name)
            .runtime(&self.runtime)
            .device_requests(vec![self.gpus.device_request()])
            .expose(u32::from(self.port), "tcp", u32::from(self.port))
            .volumes(vec![bind.as_str()])
            .cmd(command.iter().map(String::as_str).collect())
            .build()
    }
}

/// Builder interface for `SwapOptions`
pub struct SwapOptionsBuilder {
    container_name: String,
    image: ImageReference,
    model_path: PathBuf,
    port: u16,
    gpus: GpuSelection,
    runtime: String,
    mount_target: String,
    stop_timeout: Duration,
    keep_previous: bool,
    remove_volumes: bool,
    auth: Option<RegistryAuth>,
}

impl SwapOptionsBuilder {
    fn new(
        container_name: String,
        image: &str,
        model_path: PathBuf,
    ) -> Self {
        SwapOptionsBuilder {
            container_name,
            image: ImageReference::parse(image),
            model_path,
            port: DEFAULT_PORT,
            gpus: GpuSelection::All,
            runtime: DEFAULT_RUNTIME.to_owned(),
            mount_target: DEFAULT_MOUNT_TARGET.to_owned(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            keep_previous: false,
            remove_volumes: false,
            auth: None,
        }
    }

    /// Port published on the host and inside the container
    pub fn port(
        &mut self,
        port: u16,
    ) -> &mut Self {
        self.port = port;
        self
    }

    pub fn gpus(
        &mut self,
        gpus: GpuSelection,
    ) -> &mut Self {
        self.gpus = gpus;
        self
    }

    pub fn runtime<R>(
        &mut self,
        runtime: R,
    ) -> &mut Self
    where
        R: Into<String>,
    {
        self.runtime = runtime.into();
        self
    }

    /// Where the model directory appears inside the container
    pub fn mount_target<T>(
        &mut self,
        target: T,
    ) -> &mut Self
    where
        T: Into<String>,
    {
        self.mount_target = target.into();
        self
    }

    /// Grace period before the daemon kills the old container
    pub fn stop_timeout(
        &mut self,
        timeout: Duration,
    ) -> &mut Self {
        self.stop_timeout = timeout;
        self
    }

    /// Rename the old container aside instead of removing it
    pub fn keep_previous(
        &mut self,
        keep: bool,
    ) -> &mut Self {
        self.keep_previous = keep;
        self
    }

    pub fn remove_volumes(
        &mut self,
        remove: bool,
    ) -> &mut Self {
        self.remove_volumes = remove;
        self
    }

    pub fn auth(
        &mut self,
        auth: RegistryAuth,
    ) -> &mut Self {
        self.auth = Some(auth);
        self
    }

    /// Resolves the model path against the working directory and derives the model name
    pub fn build(&mut self) -> Result<SwapOptions> {
        let model_path = if self.model_path.is_absolute() {
            self.model_path.clone()
        } else {
            env::current_dir()?.join(&self.model_path)
        };
        let model_name = model_name(&model_path)?;

        Ok(SwapOptions {
            container_name: self.container_name.clone(),
            image: self.image.clone(),
            model_path,
            model_name,
            port: self.port,
            gpus: self.gpus.clone(),
            runtime: self.runtime.clone(),
            mount_target: self.mount_target.clone(),
            stop_timeout: self.stop_timeout,
            keep_previous: self.keep_previous,
            remove_volumes: self.remove_volumes,
            auth: self.auth.take(),
        })
    }
}

/// Final component of the model path, ignoring trailing separators
fn model_name(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .ok_or_else(|| Error::InvalidModelPath(path.display().to_string()))?;
    name.to_str()
        .map(str::to_owned)
        .ok_or_else(|| Error::NonUnicodeModelName(path.display().to_string()))
}

/// Milestones of a swap, in the order they happen
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Stopped { container: String },
    AlreadyStopped { container: String },
    Pulling { image: String },
    Pulled { image: String },
    PreviousRemoved { container: String },
    PreviousRenamed { container: String, to: String },
    Started { container: String, image: String },
}

impl fmt::Display for Step {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        match self {
            Step::Stopped { container } => write!(f, "Container '{}' stopped.", container),
            Step::AlreadyStopped { container } => {
                write!(f, "Container '{}' was not running.", container)
            }
            Step::Pulling { image } => write!(f, "Pulling image: {}", image),
            Step::Pulled { image } => write!(f, "Image '{}' pulled.", image),
            Step::PreviousRemoved { container } => {
                write!(f, "Previous container '{}' removed.", container)
            }
            Step::PreviousRenamed { container, to } => {
                write!(f, "Previous container '{}' renamed to '{}'.", container, to)
            }
            Step::Started { container, image } => write!(
                f,
                "Container '{}' started with image '{}'.",
                container, image
            ),
        }
    }
}

/// Outcome of a completed swap
#[derive(Clone, Debug)]
pub struct SwapReport {
    pub previous_id: String,
    pub previous_image: String,
    /// id of the pulled image the replacement runs
    pub image_id: String,
    pub container_id: String,
    pub warnings: Vec<String>,
}

/// A swap of one container onto a new image
pub struct Swap<'docker> {
    docker: &'docker Docker,
    opts: SwapOptions,
}

impl<'docker> Swap<'docker> {
    pub fn new(
        docker: &'docker Docker,
        opts: SwapOptions,
    ) -> Self {
        Swap { docker, opts }
    }

    pub fn options(&self) -> &SwapOptions {
        &self.opts
    }

    /// Runs the swap, reporting each milestone to `on_step`
    pub async fn run<F>(
        &self,
        mut on_step: F,
    ) -> Result<SwapReport>
    where
        F: FnMut(&Step),
    {
        let opts = &self.opts;
        let name = opts.container_name.clone();
        let image = opts.image.to_string();

        let previous = self.stop_previous(&mut on_step).await?;

        on_step(&Step::Pulling {
            image: image.clone(),
        });
        self.pull().await?;
        let pulled = self.docker.images().get(image.clone()).inspect().await?;
        log::info!("image {} is {}", image, pulled.id);
        on_step(&Step::Pulled {
            image: image.clone(),
        });

        let old = self.docker.containers().get(previous.id.clone());
        if opts.keep_previous {
            let to = opts.previous_name();
            old.rename(&to).await?;
            on_step(&Step::PreviousRenamed {
                container: name.clone(),
                to,
            });
        } else {
            let mut rm = RmContainerOptions::builder();
            if opts.remove_volumes {
                rm.volumes(true);
            }
            old.remove(rm.build()).await?;
            on_step(&Step::PreviousRemoved {
                container: name.clone(),
            });
        }

        let created = self
            .docker
            .containers()
            .create(&opts.container_options())
            .await?;
        let warnings = created.warnings.unwrap_or_default();
        for warning in &warnings {
            log::warn!("{}", warning);
        }
        self.docker.containers().get(created.id.clone()).start().await?;
        log::info!("started container {} for '{}'", created.id, name);
        on_step(&Step::Started {
            container: name,
            image,
        });

        Ok(SwapReport {
            previous_id: previous.id,
            previous_image: previous.image,
            image_id: pulled.id,
            container_id: created.id,
            warnings,
        })
    }

    async fn stop_previous<F>(
        &self,
        on_step: &mut F,
    ) -> Result<Previous>
    where
        F: FnMut(&Step),
    {
        let name = &self.opts.container_name;
        let details = self
            .docker
            .containers()
            .get(name.clone())
            .inspect()
            .await?;
        log::info!(
            "container '{}' ({}) currently runs {}",
            name,
            details.id,
            details.config.image
        );

        // later calls target the inspected id, not whatever holds the name
        let container = self.docker.containers().get(details.id.clone());
        if details.state.running || details.state.restarting {
            container.stop(Some(self.opts.stop_timeout)).await?;
            on_step(&Step::Stopped {
                container: name.clone(),
            });
        } else {
            log::debug!("container '{}' is {}", name, details.state.status);
            on_step(&Step::AlreadyStopped {
                container: name.clone(),
            });
        }

        Ok(Previous {
            id: details.id,
            image: details.config.image,
        })
    }

    async fn pull(&self) -> Result<()> {
        let mut opts = PullOptions::builder();
        opts.reference(&self.opts.image);
        if let Some(ref auth) = self.opts.auth {
            opts.auth(auth.clone());
        }
        let opts = opts.build();

        let mut progress = self.docker.images().pull(&opts);
        while let Some(message) = progress.try_next().await? {
            if let Some(error) = message.get("error") {
                let error = error
                    .as_str()
                    .map(str::to_owned)
                    .unwrap_or_else(|| error.to_string());
                return Err(Error::Daemon(error));
            }
            match (message.get("id"), message.get("status")) {
                (Some(id), Some(status)) => log::debug!("{}: {}", id, status),
                (None, Some(status)) => log::debug!("{}", status),
                _ => log::trace!("{}", message),
            }
        }
        Ok(())
    }
}

struct Previous {
    id: String,
    image: String,
}

/// How a failed swap is reported to the operator
#[derive(Debug)]
pub enum Failure {
    /// the container or the image does not exist
    NotFound(Error),
    /// the daemon refused a request
    Api(Error),
    Unexpected(Error),
}

impl From<Error> for Failure {
    fn from(error: Error) -> Failure {
        match error {
            e if e.is_not_found() => Failure::NotFound(e),
            e @ Error::Fault { .. } | e @ Error::Daemon(_) => Failure::Api(e),
            e => Failure::Unexpected(e),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        match self {
            Failure::NotFound(e) => write!(f, "Error: Container or image not found: {}", e),
            Failure::Api(e) => write!(f, "Docker API Error: {}", e),
            Failure::Unexpected(e) => write!(f, "An unexpected error occurred: {}", e),
        }
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Failure::NotFound(e) | Failure::Api(e) | Failure::Unexpected(e) => Some(e),
        }
    }
}
