use std::{path::PathBuf, process, time::Duration};

use clap::Parser;
use imageswap::{
    swap::{DEFAULT_MOUNT_TARGET, DEFAULT_PORT, DEFAULT_RUNTIME},
    Docker, Failure, GpuSelection, RegistryAuth, Swap, SwapOptions,
};

/// Change the image of a running vLLM container.
#[derive(Parser, Debug)]
#[command(name = "imageswap", version, about)]
struct Args {
    /// Name of the vLLM container.
    container_name: String,

    /// Name and tag of the new Docker image.
    new_image: String,

    /// Path to the model directory on the host.
    model_path: PathBuf,

    /// Port to expose.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// GPU IDs to use (e.g. 'all', '0,1').
    #[arg(long = "gpu-ids", alias = "gpu_ids", default_value = "all", value_parser = parse_gpus)]
    gpu_ids: GpuSelection,

    /// Container runtime for the new container.
    #[arg(long, default_value = DEFAULT_RUNTIME)]
    runtime: String,

    /// Where the model directory is mounted inside the container.
    #[arg(long, default_value = DEFAULT_MOUNT_TARGET)]
    mount_target: String,

    /// Seconds to wait for the old container to stop before it is killed.
    #[arg(long, default_value_t = 10)]
    stop_timeout: u64,

    /// Rename the old container to `<name>-previous` instead of removing it.
    #[arg(long)]
    keep_previous: bool,

    /// Remove the anonymous volumes of the old container along with it.
    #[arg(long, conflicts_with = "keep_previous")]
    remove_volumes: bool,

    /// Docker daemon address.
    #[arg(long, env = "DOCKER_HOST")]
    host: Option<String>,

    /// Registry user for pulling private images.
    #[arg(long, requires = "registry_password")]
    registry_username: Option<String>,

    /// Registry password for pulling private images.
    #[arg(
        long,
        env = "REGISTRY_PASSWORD",
        hide_env_values = true,
        requires = "registry_username"
    )]
    registry_password: Option<String>,

    /// Registry the credentials belong to.
    #[arg(long, requires = "registry_username")]
    registry_server: Option<String>,

    /// Registry identity token, used instead of a user and password.
    #[arg(
        long,
        env = "REGISTRY_TOKEN",
        hide_env_values = true,
        conflicts_with_all = ["registry_username", "registry_password"]
    )]
    registry_token: Option<String>,
}

fn parse_gpus(spec: &str) -> Result<GpuSelection, String> {
    GpuSelection::parse(spec).map_err(|e| e.to_string())
}

impl Args {
    fn swap_options(&self) -> imageswap::Result<SwapOptions> {
        let mut builder =
            SwapOptions::builder(&self.container_name, &self.new_image, &self.model_path);
        builder
            .port(self.port)
            .gpus(self.gpu_ids.clone())
            .runtime(&self.runtime)
            .mount_target(&self.mount_target)
            .stop_timeout(Duration::from_secs(self.stop_timeout))
            .keep_previous(self.keep_previous)
            .remove_volumes(self.remove_volumes);
        if let Some(ref token) = self.registry_token {
            builder.auth(RegistryAuth::token(token));
        } else if let (Some(username), Some(password)) =
            (&self.registry_username, &self.registry_password)
        {
            let mut auth = RegistryAuth::builder();
            auth.username(username).password(password);
            if let Some(ref server) = self.registry_server {
                auth.server_address(server);
            }
            builder.auth(auth.build());
        }
        builder.build()
    }
}

async fn run(args: Args) -> Result<(), Failure> {
    let docker = match args.host {
        Some(ref host) => Docker::from_host(host)?,
        None => Docker::from_env()?,
    };
    let version = docker.version().await?;
    log::debug!(
        "docker daemon {} (api {}) on {}/{}",
        version.version,
        version.api_version,
        version.os,
        version.arch
    );
    let opts = args.swap_options()?;
    let report = Swap::new(&docker, opts)
        .run(|step| println!("{}", step))
        .await?;
    log::info!(
        "replaced {} ({}) with {} running image {}",
        report.previous_id,
        report.previous_image,
        report.container_id,
        report.image_id
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    if let Err(failure) = run(args).await {
        eprintln!("{}", failure);
        process::exit(1);
    }
}
