//! The options graph handed to the packet forwarder.
//!
//! Concrete proxy option blocks are opaque tagged records; the model only
//! understands what routing needs: tags, groups and rules.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use std::time::Duration;

pub mod builder;

pub use builder::Builder;

pub const TAG_TUN_IN: &str = "tun-in";
pub const TAG_BYPASS_IN: &str = "bypass-in";
pub const TAG_MIXED_IN: &str = "mixed-in";
pub const TAG_DIRECT: &str = "direct";
pub const TAG_BLOCK: &str = "block";
pub const TAG_KINDLING_PROXY: &str = "kindling-proxy";
pub const TAG_AUTO_LANTERN: &str = "auto-lantern";
pub const TAG_LANTERN: &str = "lantern";
pub const TAG_AUTO_USER: &str = "auto-user";
pub const TAG_USER: &str = "user";
pub const TAG_AUTO_ALL: &str = "auto-all";

pub const MODE_AUTO: &str = "auto";
pub const MODE_LANTERN: &str = "lantern";
pub const MODE_USER: &str = "user";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Options {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Value>,
    #[serde(default)]
    pub inbounds: Vec<Inbound>,
    #[serde(default)]
    pub outbounds: Vec<Outbound>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub route: RouteOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<ExperimentalOptions>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogOptions {
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Inbound {
    Tun {
        tag: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interface_name: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        address: Vec<String>,
        auto_route: bool,
        strict_route: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auto_redirect: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        override_android_vpn: Option<bool>,
    },
    Http {
        tag: String,
        listen: String,
        listen_port: u16,
    },
    Mixed {
        tag: String,
        listen: String,
        listen_port: u16,
    },
}

impl Inbound {
    pub fn tag(&self) -> &str {
        match self {
            Inbound::Tun { tag, .. } | Inbound::Http { tag, .. } | Inbound::Mixed { tag, .. } => tag,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Direct {
        tag: String,
    },
    Block {
        tag: String,
    },
    Http {
        tag: String,
        server: String,
        server_port: u16,
    },
    Selector(SelectorOptions),
    #[serde(rename = "urltest")]
    UrlTest(UrlTestOptions),
    /// Any concrete proxy protocol; its options stay opaque.
    #[serde(untagged)]
    Proxy(ProxyOutbound),
}

impl Outbound {
    pub fn tag(&self) -> &str {
        match self {
            Outbound::Direct { tag } | Outbound::Block { tag } | Outbound::Http { tag, .. } => tag,
            Outbound::Selector(opts) => &opts.tag,
            Outbound::UrlTest(opts) => &opts.tag,
            Outbound::Proxy(opts) => &opts.tag,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Outbound::Direct { .. } => "direct",
            Outbound::Block { .. } => "block",
            Outbound::Http { .. } => "http",
            Outbound::Selector(_) => "selector",
            Outbound::UrlTest(_) => "urltest",
            Outbound::Proxy(opts) => &opts.kind,
        }
    }

    /// Child tags for composite outbounds, empty for leaves.
    pub fn children(&self) -> &[String] {
        match self {
            Outbound::Selector(opts) => &opts.outbounds,
            Outbound::UrlTest(opts) => &opts.outbounds,
            _ => &[],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectorOptions {
    pub tag: String,
    pub outbounds: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_exist_connections: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UrlTestOptions {
    pub tag: String,
    pub outbounds: Vec<String>,
    pub url: String,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProxyOutbound {
    #[serde(rename = "type")]
    pub kind: String,
    pub tag: String,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "type")]
    pub kind: String,
    pub tag: String,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteOptions {
    #[serde(default)]
    pub rules: Vec<RouteRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_set: Vec<RuleSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_detect_interface: Option<bool>,
}

/// One routing rule. Known matchers are typed; anything the server sends
/// beyond them rides along in `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inbound: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_is_private: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clash_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_set: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RouteRule {
    pub fn sniff() -> RouteRule {
        RouteRule {
            action: Some("sniff".to_string()),
            ..RouteRule::default()
        }
    }

    pub fn hijack_dns() -> RouteRule {
        RouteRule {
            action: Some("hijack-dns".to_string()),
            protocol: Some("dns".to_string()),
            ..RouteRule::default()
        }
    }

    pub fn inbound_direct(inbound_tag: &str) -> RouteRule {
        RouteRule {
            inbound: vec![inbound_tag.to_string()],
            outbound: Some(TAG_DIRECT.to_string()),
            ..RouteRule::default()
        }
    }

    pub fn private_direct() -> RouteRule {
        RouteRule {
            ip_is_private: Some(true),
            outbound: Some(TAG_DIRECT.to_string()),
            ..RouteRule::default()
        }
    }

    pub fn rule_set_direct(rule_set_tag: &str) -> RouteRule {
        RouteRule {
            rule_set: vec![rule_set_tag.to_string()],
            outbound: Some(TAG_DIRECT.to_string()),
            ..RouteRule::default()
        }
    }

    pub fn clash(mode: &str, outbound: &str) -> RouteRule {
        RouteRule {
            clash_mode: Some(mode.to_string()),
            outbound: Some(outbound.to_string()),
            ..RouteRule::default()
        }
    }

    pub fn reject() -> RouteRule {
        RouteRule {
            action: Some("reject".to_string()),
            ..RouteRule::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(rename = "type")]
    pub kind: String,
    pub tag: String,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentalOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_file: Option<CacheFileOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clash_api: Option<ClashApiOptions>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheFileOptions {
    pub enabled: bool,
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClashApiOptions {
    pub external_controller: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mode: Option<String>,
}

impl Options {
    pub fn find_outbound(&self, tag: &str) -> Option<&Outbound> {
        self.outbounds.iter().find(|o| o.tag() == tag)
    }

    pub fn outbound_tags(&self) -> Vec<String> {
        self.outbounds.iter().map(|o| o.tag().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tagged_outbounds_round_trip() -> anyhow::Result<()> {
        let raw = json!([
            {"type": "direct", "tag": "direct"},
            {"type": "selector", "tag": "lantern", "outbounds": ["auto-lantern", "ss-1"], "default": "auto-lantern"},
            {"type": "urltest", "tag": "auto-lantern", "outbounds": ["ss-1"], "url": "https://google.com/generate_204", "interval": "3m", "idle_timeout": "15m"},
            {"type": "shadowsocks", "tag": "ss-1", "server": "203.0.113.1", "server_port": 8388}
        ]);
        let outbounds: Vec<Outbound> = serde_json::from_value(raw.clone())?;

        assert!(matches!(outbounds[0], Outbound::Direct { .. }));
        assert!(matches!(outbounds[1], Outbound::Selector(_)));
        assert!(matches!(outbounds[2], Outbound::UrlTest(_)));
        match &outbounds[3] {
            Outbound::Proxy(proxy) => {
                assert_eq!(proxy.kind, "shadowsocks");
                assert_eq!(proxy.tag, "ss-1");
                assert_eq!(proxy.options["server_port"], json!(8388));
            }
            other => panic!("expected opaque proxy, got {other:?}"),
        }

        let back = serde_json::to_value(&outbounds)?;
        assert_eq!(back, raw);
        Ok(())
    }

    #[test]
    fn urltest_durations_serialize_as_humantime() -> anyhow::Result<()> {
        let urltest = Outbound::UrlTest(UrlTestOptions {
            tag: "auto-all".to_string(),
            outbounds: vec!["auto-lantern".to_string()],
            url: "https://google.com/generate_204".to_string(),
            interval: Duration::from_secs(180),
            idle_timeout: Duration::from_secs(900),
        });
        let value = serde_json::to_value(&urltest)?;
        assert_eq!(value["interval"], "3m");
        assert_eq!(value["idle_timeout"], "15m");
        Ok(())
    }

    #[test]
    fn route_rule_keeps_unknown_matchers() -> anyhow::Result<()> {
        let raw = json!({"domain_suffix": [".ads.example"], "outbound": "block"});
        let rule: RouteRule = serde_json::from_value(raw.clone())?;
        assert_eq!(rule.outbound.as_deref(), Some("block"));
        assert_eq!(rule.extra["domain_suffix"], json!([".ads.example"]));
        assert_eq!(serde_json::to_value(&rule)?, raw);
        Ok(())
    }

    #[test]
    fn children_are_exposed_for_composites() {
        let selector = Outbound::Selector(SelectorOptions {
            tag: "lantern".to_string(),
            outbounds: vec!["auto-lantern".to_string(), "ss-1".to_string()],
            default: None,
            interrupt_exist_connections: None,
        });
        assert_eq!(selector.children(), ["auto-lantern".to_string(), "ss-1".to_string()]);
        assert!(Outbound::Direct { tag: "direct".to_string() }.children().is_empty());
    }
}
