//! Composes the final options graph from base options, the server-delivered
//! config, user servers and local policy.

use thiserror::Error;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs};

use super::*;
use crate::bypass;
use crate::config::{self, RuleBlock};
use crate::kindling;
use crate::server::{self, Manager};
use crate::settings::{self, Settings};

pub const URL_TEST_URL: &str = "https://google.com/generate_204";
pub const URL_TEST_INTERVAL: Duration = Duration::from_secs(3 * 60);
pub const URL_TEST_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

pub const ENV_VAR_USE_SOCKS: &str = "USE_SOCKS";
pub const ENV_VAR_SOCKS_ADDRESS: &str = "SOCKS_ADDRESS";
const DEFAULT_SOCKS_ADDRESS: &str = "127.0.0.1:1080";

pub const CACHE_FILE: &str = "lantern.cache";
pub const SPLIT_TUNNEL_FILE: &str = "split-tunnel.json";
pub const SPLIT_TUNNEL_TAG: &str = "split-tunnel";
pub const DEBUG_DUMP_FILE: &str = "debug-lantern-box-options.json";
pub const CLASH_API_ADDRESS: &str = "127.0.0.1:9090";

#[derive(Debug, Error)]
pub enum Error {
    #[error("no outbounds available in any group")]
    NoOutbounds,
    #[error("config error: {0}")]
    Config(#[from] config::Error),
    #[error("malformed option block: {0}")]
    Json(#[from] serde_json::Error),
}

/// Which top-level group auto-selection starts in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreferredGroup {
    Lantern,
    User,
    All,
}

impl PreferredGroup {
    pub fn as_mode(&self) -> &'static str {
        match self {
            PreferredGroup::Lantern => MODE_LANTERN,
            PreferredGroup::User => MODE_USER,
            PreferredGroup::All => MODE_AUTO,
        }
    }
}

impl FromStr for PreferredGroup {
    type Err = server::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lantern" => Ok(PreferredGroup::Lantern),
            "user" => Ok(PreferredGroup::User),
            "all" | "auto" => Ok(PreferredGroup::All),
            other => Err(server::Error::UnknownGroup(other.to_string())),
        }
    }
}

pub struct Builder<'a> {
    data_dir: &'a Path,
    group: PreferredGroup,
    settings: &'a Settings,
    servers: &'a Manager,
}

impl<'a> Builder<'a> {
    pub fn new(data_dir: &'a Path, group: PreferredGroup, settings: &'a Settings, servers: &'a Manager) -> Builder<'a> {
        Builder {
            data_dir,
            group,
            settings,
            servers,
        }
    }

    pub fn build(&self) -> Result<Options, Error> {
        let mut options = base_options(self.data_dir, self.group);
        apply_platform_overrides(&mut options);
        if env::var(ENV_VAR_USE_SOCKS).is_ok() {
            let address = env::var(ENV_VAR_SOCKS_ADDRESS).unwrap_or_else(|_| DEFAULT_SOCKS_ADDRESS.to_string());
            apply_socks_override(&mut options, &address);
        }

        let mut policy_rules: Vec<RouteRule> = Vec::new();
        let mut lantern_tags: Vec<String> = Vec::new();

        let config = match config::load(self.data_dir) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = ?e, "building without unreadable config");
                None
            }
        };
        if let Some(config) = &config {
            if self.settings.get_bool(settings::SMART_ROUTING) == Some(true) {
                if let Some(block) = &config.smart_routing {
                    merge_rule_block(&mut options, &mut policy_rules, block, true)?;
                }
            }
            if self.settings.get_bool(settings::AD_BLOCK) == Some(true) {
                if let Some(block) = &config.ad_block {
                    merge_rule_block(&mut options, &mut policy_rules, block, false)?;
                }
            }

            for raw in &config.outbounds {
                let outbound: Outbound = serde_json::from_value(raw.clone())?;
                lantern_tags.push(outbound.tag().to_string());
                options.outbounds.push(outbound);
            }
            for raw in &config.endpoints {
                let endpoint: Endpoint = serde_json::from_value(raw.clone())?;
                lantern_tags.push(endpoint.tag.clone());
                options.endpoints.push(endpoint);
            }
            if let Some(dns) = &config.dns {
                options.dns = Some(dns.clone());
            }
        }

        append_group(&mut options, TAG_AUTO_LANTERN, TAG_LANTERN, &lantern_tags);

        let mut user_tags: Vec<String> = Vec::new();
        for server in self.servers.get_servers_in(server::Group::User) {
            user_tags.push(server.tag.clone());
            options.outbounds.push(Outbound::Proxy(ProxyOutbound {
                kind: server.kind,
                tag: server.tag,
                options: server.options,
            }));
        }
        append_group(&mut options, TAG_AUTO_USER, TAG_USER, &user_tags);

        if lantern_tags.is_empty() && user_tags.is_empty() {
            return Err(Error::NoOutbounds);
        }

        options.outbounds.push(Outbound::UrlTest(UrlTestOptions {
            tag: TAG_AUTO_ALL.to_string(),
            outbounds: vec![TAG_AUTO_LANTERN.to_string(), TAG_AUTO_USER.to_string()],
            url: URL_TEST_URL.to_string(),
            interval: URL_TEST_INTERVAL,
            idle_timeout: URL_TEST_IDLE_TIMEOUT,
        }));

        options.route.rules.extend(policy_rules);
        options.route.rules.push(RouteRule::clash(MODE_AUTO, TAG_AUTO_ALL));
        options.route.rules.push(RouteRule::clash(MODE_LANTERN, TAG_LANTERN));
        options.route.rules.push(RouteRule::clash(MODE_USER, TAG_USER));
        options.route.rules.push(RouteRule::reject());

        dump_debug(self.data_dir, &options);
        Ok(options)
    }
}

fn base_options(data_dir: &Path, group: PreferredGroup) -> Options {
    let cache_path = data_dir.join(CACHE_FILE);
    let split_tunnel_path = data_dir.join(SPLIT_TUNNEL_FILE);
    let bypass_port = bypass::ADDRESS.rsplit(':').next().and_then(|p| p.parse().ok()).unwrap_or(14985);
    let kindling_port = kindling::PROXY_ADDRESS
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(14988);

    Options {
        log: Some(LogOptions {
            level: "info".to_string(),
            output: Some(data_dir.join(crate::logging::LOG_FILE).display().to_string()),
        }),
        dns: None,
        inbounds: vec![
            Inbound::Tun {
                tag: TAG_TUN_IN.to_string(),
                interface_name: None,
                address: vec!["172.19.0.1/30".to_string()],
                auto_route: true,
                strict_route: true,
                auto_redirect: None,
                override_android_vpn: None,
            },
            Inbound::Http {
                tag: TAG_BYPASS_IN.to_string(),
                listen: "127.0.0.1".to_string(),
                listen_port: bypass_port,
            },
        ],
        outbounds: vec![
            Outbound::Direct {
                tag: TAG_DIRECT.to_string(),
            },
            Outbound::Block {
                tag: TAG_BLOCK.to_string(),
            },
            Outbound::Http {
                tag: TAG_KINDLING_PROXY.to_string(),
                server: "127.0.0.1".to_string(),
                server_port: kindling_port,
            },
        ],
        endpoints: Vec::new(),
        route: RouteOptions {
            rules: vec![
                RouteRule::sniff(),
                RouteRule::hijack_dns(),
                RouteRule::inbound_direct(TAG_BYPASS_IN),
                RouteRule::private_direct(),
                RouteRule::rule_set_direct(SPLIT_TUNNEL_TAG),
            ],
            rule_set: vec![RuleSet {
                kind: "local".to_string(),
                tag: SPLIT_TUNNEL_TAG.to_string(),
                options: serde_json::json!({
                    "format": "source",
                    "path": split_tunnel_path.display().to_string(),
                })
                .as_object()
                .cloned()
                .unwrap_or_default(),
            }],
            auto_detect_interface: Some(true),
        },
        experimental: Some(ExperimentalOptions {
            cache_file: Some(CacheFileOptions {
                enabled: true,
                path: cache_path.display().to_string(),
            }),
            clash_api: Some(ClashApiOptions {
                external_controller: CLASH_API_ADDRESS.to_string(),
                default_mode: Some(group.as_mode().to_string()),
            }),
        }),
    }
}

fn apply_platform_overrides(options: &mut Options) {
    for inbound in &mut options.inbounds {
        if let Inbound::Tun {
            auto_redirect,
            override_android_vpn,
            ..
        } = inbound
        {
            if cfg!(target_os = "android") {
                *override_android_vpn = Some(true);
            }
            if cfg!(target_os = "linux") {
                *auto_redirect = Some(true);
            }
        }
    }
}

/// `USE_SOCKS` replaces every inbound with a single mixed HTTP/SOCKS
/// listener; useful where a TUN device is unavailable.
fn apply_socks_override(options: &mut Options, address: &str) {
    let (listen, port) = match address.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(1080)),
        None => (address.to_string(), 1080),
    };
    options.inbounds = vec![Inbound::Mixed {
        tag: TAG_MIXED_IN.to_string(),
        listen,
        listen_port: port,
    }];
}

fn merge_rule_block(
    options: &mut Options,
    policy_rules: &mut Vec<RouteRule>,
    block: &RuleBlock,
    include_outbounds: bool,
) -> Result<(), Error> {
    if include_outbounds {
        for raw in &block.outbounds {
            options.outbounds.push(serde_json::from_value(raw.clone())?);
        }
    }
    for raw in &block.rules {
        policy_rules.push(serde_json::from_value(raw.clone())?);
    }
    for raw in &block.rule_sets {
        options.route.rule_set.push(serde_json::from_value(raw.clone())?);
    }
    Ok(())
}

fn append_group(options: &mut Options, auto_tag: &str, group_tag: &str, member_tags: &[String]) {
    options.outbounds.push(Outbound::UrlTest(UrlTestOptions {
        tag: auto_tag.to_string(),
        outbounds: member_tags.to_vec(),
        url: URL_TEST_URL.to_string(),
        interval: URL_TEST_INTERVAL,
        idle_timeout: URL_TEST_IDLE_TIMEOUT,
    }));

    let mut children = vec![auto_tag.to_string()];
    children.extend(member_tags.iter().cloned());
    options.outbounds.push(Outbound::Selector(SelectorOptions {
        tag: group_tag.to_string(),
        outbounds: children,
        default: Some(auto_tag.to_string()),
        interrupt_exist_connections: None,
    }));
}

fn dump_debug(data_dir: &Path, options: &Options) {
    let dump = match serde_json::to_vec_pretty(options) {
        Ok(dump) => dump,
        Err(e) => {
            tracing::warn!(error = ?e, "failed serializing options dump");
            return;
        }
    };
    let path: PathBuf = data_dir.join(DEBUG_DUMP_FILE);
    if let Err(e) = fs::write(&path, dump) {
        tracing::warn!(error = ?e, path = %path.display(), "failed writing options dump");
    }
}
