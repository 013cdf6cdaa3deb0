//! Docker container backend: one container spawned per client connection

use crate::backend::{free_port, Backend, BackendFactory};
use crate::error::Error;
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Seconds the engine waits before killing a container on stop
const STOP_TIMEOUT_SECS: i64 = 10;

/// Produces a fresh [`DockerBackend`] per connection
pub struct DockerFactory {
    image: String,
    container_port: u16,
    network: Option<String>,
}

impl DockerFactory {
    pub fn new(image: String, container_port: u16, network: Option<String>) -> Self {
        Self {
            image,
            container_port,
            network,
        }
    }
}

#[async_trait]
impl BackendFactory for DockerFactory {
    async fn create(&self) -> Result<Box<dyn Backend>, Error> {
        info!(image = %self.image, "Creating Docker backend");
        let backend =
            DockerBackend::provision(&self.image, self.container_port, self.network.as_deref())
                .await
                .map_err(|e| {
                    warn!(image = %self.image, error = %e, "Docker backend provisioning failed");
                    Error::BackendUnavailable(e.to_string())
                })?;
        Ok(Box::new(backend))
    }
}

/// A running container handling one client stream
pub struct DockerBackend {
    client: Docker,
    container_id: String,
    target: SocketAddr,
    running: Mutex<bool>,
}

impl DockerBackend {
    /// Create and start a container for one connection.
    ///
    /// When the proxy itself runs inside a container the new container joins
    /// the shared network and is dialled at its own IP on the internal port.
    /// Otherwise an ephemeral host port is reserved and bound to the
    /// container's internal port.
    pub async fn provision(
        image: &str,
        container_port: u16,
        network: Option<&str>,
    ) -> Result<DockerBackend, Error> {
        let client = connect().await?;

        let port_key = format!("{}/tcp", container_port);
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key.clone(), HashMap::new());

        let containerized = running_inside_container();
        let mut host_port = None;

        let host_config = if containerized {
            network.map(|name| HostConfig {
                network_mode: Some(name.to_string()),
                ..Default::default()
            })
        } else {
            let port = free_port().await?;
            host_port = Some(port);
            let mut bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
            bindings.insert(
                port_key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(port.to_string()),
                }]),
            );
            Some(HostConfig {
                port_bindings: Some(bindings),
                ..Default::default()
            })
        };

        let container_config = ContainerConfig {
            image: Some(image.to_string()),
            exposed_ports: Some(exposed_ports),
            host_config,
            ..Default::default()
        };

        let container_id = match client
            .create_container(
                None::<CreateContainerOptions<String>>,
                container_config.clone(),
            )
            .await
        {
            Ok(response) => response.id,
            Err(e) if is_image_missing(&e) => {
                pull_image(&client, image).await?;
                client
                    .create_container(None::<CreateContainerOptions<String>>, container_config)
                    .await
                    .map_err(|e| {
                        Error::EngineUnavailable(format!("container create after pull: {}", e))
                    })?
                    .id
            }
            Err(e) => {
                return Err(Error::EngineUnavailable(format!("container create: {}", e)))
            }
        };

        client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::EngineUnavailable(format!("container start: {}", e)))?;
        info!(container_id = %container_id, image, "Started backend container");

        let target = if containerized {
            let ip = container_ip(&client, &container_id, network).await?;
            SocketAddr::new(ip, container_port)
        } else {
            let port = host_port.expect("host-binding mode reserves a port");
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
        };
        debug!(container_id = %container_id, target = %target, "Backend container listening");

        Ok(DockerBackend {
            client,
            container_id,
            target,
            running: Mutex::new(true),
        })
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn id(&self) -> &str {
        &self.container_id
    }

    async fn target(&self) -> Result<SocketAddr, Error> {
        Ok(self.target)
    }

    async fn terminate(&self) {
        let mut running = self.running.lock().await;
        if !*running {
            return;
        }

        info!(container_id = %self.container_id, "Stopping backend container");
        match self
            .client
            .stop_container(
                &self.container_id,
                Some(StopContainerOptions {
                    t: STOP_TIMEOUT_SECS,
                }),
            )
            .await
        {
            Ok(()) => *running = false,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            })
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id = %self.container_id, "Container already stopped");
                *running = false;
            }
            Err(e) => {
                // The container may leak; operators can reap it later.
                warn!(container_id = %self.container_id, error = %e, "Failed to stop container");
            }
        }
    }
}

/// Connect to the engine: `DOCKER_HOST` wins, otherwise the platform socket
async fn connect() -> Result<Docker, Error> {
    let client = if let Ok(host) = std::env::var("DOCKER_HOST") {
        if host.starts_with("unix://") {
            Docker::connect_with_socket(
                host.trim_start_matches("unix://"),
                120,
                bollard::API_DEFAULT_VERSION,
            )
        } else {
            Docker::connect_with_http(&host, 120, bollard::API_DEFAULT_VERSION)
        }
    } else {
        Docker::connect_with_socket_defaults()
    }
    .map_err(|e| Error::EngineUnavailable(format!("docker connection: {}", e)))?;

    client
        .ping()
        .await
        .map_err(|e| Error::EngineUnavailable(format!("docker daemon not responding: {}", e)))?;

    Ok(client)
}

/// Pull an image, streaming progress and printing a dot each second
async fn pull_image(client: &Docker, image: &str) -> Result<(), Error> {
    print!("Pulling image {} ", image);
    let _ = std::io::stdout().flush();

    let options = CreateImageOptions {
        from_image: image,
        ..Default::default()
    };
    let mut stream = client.create_image(Some(options), None, None);

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(progress)) => {
                    if let Some(reason) = progress.error {
                        println!();
                        return Err(Error::ImagePull {
                            image: image.to_string(),
                            reason,
                        });
                    }
                }
                Some(Err(e)) => {
                    println!();
                    return Err(Error::ImagePull {
                        image: image.to_string(),
                        reason: e.to_string(),
                    });
                }
                None => break,
            },
            _ = ticker.tick() => {
                print!(".");
                let _ = std::io::stdout().flush();
            }
        }
    }

    println!(" done");
    info!(image, "Image pulled");
    Ok(())
}

/// Read the container's routable IP after it joined a network
async fn container_ip(
    client: &Docker,
    container_id: &str,
    network: Option<&str>,
) -> Result<IpAddr, Error> {
    let inspect = client
        .inspect_container(container_id, None)
        .await
        .map_err(|e| Error::EngineUnavailable(format!("container inspect: {}", e)))?;

    let settings = inspect.network_settings.ok_or_else(|| {
        Error::TargetUnresolvable(format!("container {} has no network settings", container_id))
    })?;

    // A named network reports its address under networks[name]; the default
    // bridge uses the flat ip_address field.
    let raw = network
        .and_then(|name| {
            settings
                .networks
                .as_ref()
                .and_then(|nets| nets.get(name))
                .and_then(|endpoint| endpoint.ip_address.clone())
        })
        .or(settings.ip_address)
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| {
            Error::TargetUnresolvable(format!("container {} has no IP address", container_id))
        })?;

    raw.parse().map_err(|_| {
        Error::TargetUnresolvable(format!("container {} has invalid IP '{}'", container_id, raw))
    })
}

fn is_image_missing(err: &bollard::errors::Error) -> bool {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => true,
        other => other.to_string().contains("No such image"),
    }
}

/// True when PID 1's cgroup paths name a docker segment.
///
/// A missing or unreadable /proc/1/cgroup means "not containerized".
pub fn running_inside_container() -> bool {
    cgroup_names_docker(&std::fs::read_to_string("/proc/1/cgroup").unwrap_or_default())
}

fn cgroup_names_docker(contents: &str) -> bool {
    contents.lines().any(|line| {
        line.splitn(3, ':')
            .nth(2)
            .map(|path| path.split('/').any(|segment| segment == "docker"))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cgroup_docker_detected() {
        let contents = "12:pids:/docker/8f2e4c9a\n11:memory:/docker/8f2e4c9a\n";
        assert!(cgroup_names_docker(contents));
    }

    #[test]
    fn test_cgroup_host_not_detected() {
        let contents = "12:pids:/init.scope\n11:memory:/user.slice/user-1000.slice\n";
        assert!(!cgroup_names_docker(contents));
    }

    #[test]
    fn test_cgroup_empty_or_malformed() {
        assert!(!cgroup_names_docker(""));
        assert!(!cgroup_names_docker("garbage without colons\n"));
        assert!(!cgroup_names_docker("0::/\n"));
    }

    #[test]
    fn test_image_missing_classification() {
        let not_found = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such image: example/session:latest".to_string(),
        };
        assert!(is_image_missing(&not_found));

        let conflict = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "name already in use".to_string(),
        };
        assert!(!is_image_missing(&conflict));
    }
}
