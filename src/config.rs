use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use hickory_server::proto::rr::Name;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::forward::Forwarder;
use crate::policy::Policy;
use crate::pool::{ProxyPool, MAX_UPSTREAMS};
use crate::proxy::Proxy;
use crate::transport::TlsSettings;
use crate::types::EdgeSite;

/// Port table updates are pushed to and received on.
pub const DEFAULT_PUSH_PORT: u16 = 8053;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SiteConfig {
    pub ip: String,
    pub lat: f64,
    pub lon: f64,
}

/// `tls` directive: client certificate, key and CA bundle, all PEM.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TlsFiles {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
}

/// Where the local site's services come from.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DiscoveryConfig {
    Docker {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        network: Option<String>,
    },
    Static {
        #[serde(default)]
        services: Vec<serde_json::Value>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub site: SiteConfig,
    /// Seconds between polls of the local service source.
    pub svc_read_interval: u64,
    /// Seconds between pushes to each peer.
    pub svc_push_interval: u64,
    pub from: String,
    pub to: Vec<String>,
    pub except: Vec<String>,
    pub max_fails: i64,
    pub health_check: String,
    pub force_tcp: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsFiles>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_servername: Option<String>,
    pub expire: String,
    pub policy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<String>,
    pub dns_bind: SocketAddr,
    pub push_port: u16,
    pub discovery: DiscoveryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site: SiteConfig {
                ip: "127.0.0.1".into(),
                lat: 0.0,
                lon: 0.0,
            },
            svc_read_interval: 5,
            svc_push_interval: 10,
            from: ".".into(),
            to: Vec::new(),
            except: Vec::new(),
            max_fails: 2,
            health_check: "500ms".into(),
            force_tcp: false,
            tls: None,
            tls_servername: None,
            expire: "10s".into(),
            policy: "round_robin".into(),
            bind_ip: None,
            dns_bind: SocketAddr::from(([0, 0, 0, 0], 53)),
            push_port: DEFAULT_PUSH_PORT,
            discovery: DiscoveryConfig::Docker { network: None },
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("edged.toml"))
            .merge(Json::file("edged.json"))
            .merge(Env::prefixed("EDGED_").split("__"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // If bind_ip is set, override the IP part of dns_bind
        if let Some(ref ip) = config.bind_ip {
            let port = config.dns_bind.port();
            config.dns_bind = format!("{}:{}", ip, port)
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid bind_ip: {}", e))?;
        }

        Ok(config)
    }

    pub fn site(&self) -> EdgeSite {
        EdgeSite::new(self.site.ip.clone(), self.site.lat, self.site.lon)
    }

    /// Address the table-sync listener binds.
    pub fn push_listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.dns_bind.ip(), self.push_port)
    }

    pub fn max_fails(&self) -> Result<u32, ConfigError> {
        u32::try_from(self.max_fails).map_err(|_| ConfigError::Negative {
            directive: "max_fails",
            value: self.max_fails.to_string(),
        })
    }

    pub fn health_check(&self) -> Result<Duration, ConfigError> {
        parse_duration("health_check", &self.health_check)
    }

    pub fn expire(&self) -> Result<Duration, ConfigError> {
        parse_duration("expire", &self.expire)
    }

    pub fn policy(&self) -> Result<Policy, ConfigError> {
        self.policy.parse()
    }

    pub fn zone(&self) -> Result<Name, ConfigError> {
        parse_zone(&self.from)
    }

    pub fn ignored(&self) -> Result<Vec<Name>, ConfigError> {
        self.except.iter().map(|z| parse_zone(z)).collect()
    }

    /// Build the forwarder described by the upstream directives.
    pub fn forwarder(&self) -> Result<Forwarder, ConfigError> {
        let upstreams = parse_upstreams(&self.to)?;
        if upstreams.is_empty() {
            return Err(ConfigError::NoUpstreams);
        }
        if upstreams.len() > MAX_UPSTREAMS {
            return Err(ConfigError::TooManyUpstreams {
                max: MAX_UPSTREAMS,
                got: upstreams.len(),
            });
        }

        let expire = self.expire()?;
        let tls = if upstreams.iter().any(|u| u.tls) {
            Some(TlsSettings {
                config: tls_client_config(self.tls.as_ref().unwrap_or(&TlsFiles::default()))?,
                server_name: self.tls_servername.clone(),
            })
        } else {
            None
        };

        let proxies = upstreams
            .into_iter()
            .map(|upstream| {
                let mut proxy = Proxy::new(upstream.addr, None);
                if upstream.tls {
                    if let Some(tls) = &tls {
                        proxy.set_tls(tls.clone());
                    }
                }
                proxy.set_expire(expire);
                proxy
            })
            .collect();

        Ok(Forwarder::new(ProxyPool::new(proxies, self.policy()?))
            .with_max_fails(self.max_fails()?)
            .with_health_check(self.health_check()?)
            .with_force_tcp(self.force_tcp))
    }
}

/// One parsed `to` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upstream {
    pub addr: SocketAddr,
    pub tls: bool,
}

/// Parse `to` entries: `[dns://|tls://]host[:port]` or a resolv.conf path.
pub fn parse_upstreams(entries: &[String]) -> Result<Vec<Upstream>, ConfigError> {
    let mut out = Vec::new();
    for entry in entries {
        let (tls, host) = match entry.strip_prefix("tls://") {
            Some(rest) => (true, rest),
            None => (false, entry.strip_prefix("dns://").unwrap_or(entry)),
        };

        let addrs = match parse_host_port(host) {
            Some(addr) => vec![addr],
            None if Path::new(host).is_file() => parse_resolv_conf(host)?,
            None => return Err(ConfigError::InvalidUpstream(entry.clone())),
        };

        for mut addr in addrs {
            // TLS can't be on 53; treat it as the default port.
            if tls && addr.port() == 53 {
                addr.set_port(853);
            }
            out.push(Upstream { addr, tls });
        }
    }
    Ok(out)
}

fn parse_host_port(host: &str) -> Option<SocketAddr> {
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Some(addr);
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, 53))
}

fn parse_resolv_conf(path: &str) -> Result<Vec<SocketAddr>, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let addrs: Vec<SocketAddr> = contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("nameserver"), Some(ns)) => parse_host_port(ns),
                _ => None,
            }
        })
        .collect();
    if addrs.is_empty() {
        return Err(ConfigError::InvalidUpstream(path.to_string()));
    }
    Ok(addrs)
}

fn parse_zone(zone: &str) -> Result<Name, ConfigError> {
    let mut name = Name::from_str(zone)
        .map_err(|_| ConfigError::InvalidZone(zone.to_string()))?
        .to_lowercase();
    name.set_fqdn(true);
    Ok(name)
}

/// Parse a duration such as `500ms`, `10s` or `1m30s`.  A bare `0` is
/// accepted; any other number needs a unit.
pub fn parse_duration(directive: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let s = value.trim();
    if s.starts_with('-') {
        return Err(ConfigError::Negative {
            directive,
            value: value.to_string(),
        });
    }
    let s = s.strip_prefix('+').unwrap_or(s);
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(s).map_err(|_| ConfigError::InvalidDuration {
        directive,
        value: value.to_string(),
    })
}

/// Client TLS config: roots from `ca` or the bundled web roots, plus an
/// optional client certificate.
pub fn tls_client_config(files: &TlsFiles) -> Result<Arc<rustls::ClientConfig>, ConfigError> {
    let tls_err = |e: &dyn std::fmt::Display| ConfigError::Tls(e.to_string());

    let mut roots = rustls::RootCertStore::empty();
    match &files.ca {
        Some(ca) => {
            let mut reader = BufReader::new(File::open(ca)?);
            for cert in rustls_pemfile::certs(&mut reader) {
                roots.add(cert?).map_err(|e| tls_err(&e))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let builder = rustls::ClientConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()
    .map_err(|e| tls_err(&e))?
    .with_root_certificates(roots);

    let config = match (&files.cert, &files.key) {
        (Some(cert), Some(key)) => {
            let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))
                .collect::<Result<Vec<_>, _>>()?;
            let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key)?))?
                .ok_or_else(|| ConfigError::Tls(format!("no private key in {}", key)))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| tls_err(&e))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => return Err(ConfigError::Tls("tls needs both cert and key".into())),
    };
    Ok(Arc::new(config))
}
