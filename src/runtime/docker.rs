use super::ServiceSource;
use crate::types::Service;
use anyhow::Result;
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::ContainerSummary;
use bollard::Docker;
use log::debug;
use serde_json::json;
use std::collections::{HashMap, HashSet};

/// Running Docker containers, optionally restricted to one network.
///
/// Each container becomes a service `{name, address, image}`.
pub struct DockerServices {
    network_name: Option<String>,
}

impl DockerServices {
    pub fn new(network_name: Option<String>) -> Self {
        Self { network_name }
    }

    fn connect() -> Result<Docker> {
        // Unix socket on Linux, named pipe on Windows.
        Docker::connect_with_local_defaults().map_err(Into::into)
    }
}

#[async_trait]
impl ServiceSource for DockerServices {
    async fn services(&self) -> Result<HashSet<Service>> {
        let docker = Self::connect()?;

        let mut filters = HashMap::new();
        filters.insert("status".to_string(), vec!["running".to_string()]);
        if let Some(network) = &self.network_name {
            filters.insert("network".to_string(), vec![network.clone()]);
        }
        let opts = ListContainersOptions::<String> {
            all: false,
            filters,
            ..Default::default()
        };
        let containers = docker.list_containers(Some(opts)).await?;
        debug!("Docker reports {} running containers", containers.len());

        let services = containers
            .iter()
            .filter_map(|c| to_service(c, self.network_name.as_deref()))
            .collect();
        Ok(services)
    }
}

fn to_service(c: &ContainerSummary, network_name: Option<&str>) -> Option<Service> {
    let name = c
        .names
        .as_ref()
        .and_then(|n| n.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .or_else(|| c.id.clone())?;
    let address = get_ip_for_network(c, network_name)?;
    Some(Service::new(json!({
        "name": name,
        "address": address,
        "image": c.image.clone().unwrap_or_default(),
    })))
}

/// The container's IPv4 (else global IPv6) address on `network_name`, or
/// on its first network carrying an address when no network is named.
fn get_ip_for_network(c: &ContainerSummary, network_name: Option<&str>) -> Option<String> {
    let networks = c.network_settings.as_ref()?.networks.as_ref()?;
    let address = |net: &bollard::models::EndpointSettings| {
        net.ip_address
            .clone()
            .filter(|ip| !ip.is_empty())
            .or_else(|| net.global_ipv6_address.clone().filter(|ip| !ip.is_empty()))
    };
    match network_name {
        Some(name) => networks.get(name).and_then(address),
        None => {
            let mut names: Vec<&String> = networks.keys().collect();
            names.sort();
            names.into_iter().find_map(|name| address(&networks[name]))
        }
    }
}
