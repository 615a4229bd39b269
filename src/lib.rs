//! Imageswap replaces a running inference-server container with one built from a new
//! image, talking to the [docker](https://www.docker.com/) daemon over its HTTP API.
//!
//! # examples
//!
//! ```no_run
//! use imageswap::{Docker, GpuSelection, Swap, SwapOptions};
//!
//! # async fn run() -> imageswap::Result<()> {
//! let docker = Docker::from_env()?;
//! let opts = SwapOptions::builder("vllm", "vllm/vllm-openai:v0.4.2", "/models/llama-3-8b")
//!     .port(8000)
//!     .gpus(GpuSelection::parse("0,1")?)
//!     .build()?;
//!
//! let report = Swap::new(&docker, opts)
//!     .run(|step| println!("{}", step))
//!     .await?;
//! println!("new container {}", report.container_id);
//! # Ok(())
//! # }
//! ```

pub mod container;
pub mod docker;
pub mod errors;
pub mod gpu;
pub mod image;
pub mod swap;
pub mod transport;

pub use crate::{
    container::{
        Container, ContainerOptions, ContainerOptionsBuilder, Containers, RmContainerOptions,
    },
    docker::Docker,
    errors::{Error, Result},
    gpu::{DeviceRequest, GpuSelection},
    image::{Image, ImageReference, Images, PullOptions, RegistryAuth},
    swap::{Failure, Step, Swap, SwapOptions, SwapReport},
};
